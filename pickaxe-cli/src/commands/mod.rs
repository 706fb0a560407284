pub mod hash;
pub mod run;
pub mod target;
