//! Pickaxe Hash - proof-of-work primitives
//!
//! This crate provides the arithmetic the search loop depends on: double
//! SHA-256 digests, compact-target expansion, hash-versus-target comparison
//! and the 80-byte header template that is hashed for every nonce.

pub mod digest;
pub mod header;
pub mod target;

// Re-export main types
pub use digest::{double_sha256, sha256, Hash256};
pub use header::{HeaderTemplate, HEADER_SIZE, NONCE_OFFSET};
pub use target::{meets_target, Target};
