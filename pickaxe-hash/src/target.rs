//! Difficulty targets and the proof-of-work check
//!
//! A target is a 256-bit number stored little-endian, the same byte order
//! as [`Hash256`], so a digest can be compared to it directly.

use crate::digest::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compact bits of the difficulty-1 target.
pub const DIFF1_BITS: u32 = 0x1d00ffff;

/// 256-bit little-endian difficulty target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// Largest possible target; every hash meets it.
    pub const MAX: Target = Target([0xff; 32]);

    /// Zero target; only the all-zero hash meets it.
    pub const ZERO: Target = Target([0u8; 32]);

    /// Create from little-endian bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Expand the compact `bits` encoding.
    ///
    /// The high byte is a base-256 exponent and the low three bytes a
    /// mantissa: `target = mantissa * 256^(exponent - 3)`. A mantissa byte
    /// whose position falls below byte 0 or above byte 31 is dropped.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as i32;
        let mantissa = (bits & 0x00ff_ffff).to_le_bytes();

        let mut target = [0u8; 32];
        for (k, byte) in mantissa[..3].iter().enumerate() {
            let position = exponent - 3 + k as i32;
            if (0..32).contains(&position) {
                target[position as usize] = *byte;
            }
        }

        Self(target)
    }

    /// Convert a pool share difficulty to a target: `DIFF1 / difficulty`.
    ///
    /// Non-positive or NaN difficulties map to [`Target::MAX`], infinite
    /// ones to [`Target::ZERO`]. The quotient is computed in floating point,
    /// which keeps 53 significant bits; pools never need more.
    pub fn from_difficulty(difficulty: f64) -> Self {
        if difficulty.is_nan() || difficulty <= 0.0 {
            return Self::MAX;
        }
        if difficulty.is_infinite() {
            return Self::ZERO;
        }

        // DIFF1 = 0xffff * 2^208
        let quotient = 65535.0 / difficulty;
        if quotient >= 2f64.powi(48) {
            return Self::MAX;
        }

        // floor(quotient * 2^64) fits in 112 bits, shifted left by 144 more
        let scaled = (quotient * 2f64.powi(64)) as u128;
        let mut target = [0u8; 32];
        target[18..32].copy_from_slice(&scaled.to_le_bytes()[..14]);
        Self(target)
    }

    /// Render as hex, most significant byte first
    pub fn to_hex(&self) -> String {
        Hash256(self.0).to_hex()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Check whether `hash` satisfies `target` (`hash <= target`).
///
/// Both are little-endian, so the walk starts at the last byte. Called once
/// per nonce; must stay allocation free.
#[inline]
pub fn meets_target(hash: &Hash256, target: &Target) -> bool {
    for i in (0..32).rev() {
        if hash.0[i] < target.0[i] {
            return true;
        }
        if hash.0[i] > target.0[i] {
            return false;
        }
    }
    true // Equal means it meets target
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn le_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
        a.iter().rev().cmp(b.iter().rev())
    }

    #[test]
    fn test_diff1_target() {
        let target = Target::from_compact(DIFF1_BITS);
        assert_eq!(
            target.to_hex(),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
        // Mantissa high byte (0x00) lands at exponent - 1
        assert_eq!(target.0[28], 0x00);
        assert_eq!(target.0[27], 0xff);
        assert_eq!(target.0[26], 0xff);
        assert!(target.0[29..].iter().all(|b| *b == 0));
        assert!(target.0[..26].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_small_exponents_shift_out() {
        assert_eq!(Target::from_compact(0x00123456), Target::ZERO);

        let one = Target::from_compact(0x01123456);
        assert_eq!(one.0[0], 0x12);
        assert!(one.0[1..].iter().all(|b| *b == 0));

        let two = Target::from_compact(0x02123456);
        assert_eq!(&two.0[..2], &[0x34, 0x12]);

        let three = Target::from_compact(0x03123456);
        assert_eq!(&three.0[..3], &[0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_large_exponents_clamp() {
        let full = Target::from_compact(0x20123456);
        assert_eq!(&full.0[29..], &[0x56, 0x34, 0x12]);

        let over = Target::from_compact(0x21123456);
        assert_eq!(&over.0[30..], &[0x56, 0x34]);
        assert_eq!(over.0[29], 0);

        let far = Target::from_compact(0x22123456);
        assert_eq!(far.0[31], 0x56);
        assert!(far.0[..31].iter().all(|b| *b == 0));

        assert_eq!(Target::from_compact(0x23123456), Target::ZERO);
        assert_eq!(Target::from_compact(0xff123456), Target::ZERO);
    }

    #[test]
    fn test_meets_target_edges() {
        let target = Target::from_compact(DIFF1_BITS);
        assert!(meets_target(&Hash256(target.0), &target));
        assert!(meets_target(&Hash256::default(), &target));

        let mut above = target.0;
        above[28] = 1;
        assert!(!meets_target(&Hash256(above), &target));

        // Low bytes matter only once the high bytes tie
        let mut below = target.0;
        below[26] = 0xfe;
        below[0] = 0xff;
        assert!(meets_target(&Hash256(below), &target));

        assert!(meets_target(&Hash256([0xff; 32]), &Target::MAX));
        assert!(!meets_target(&Hash256([0x01; 32]), &Target::ZERO));
    }

    #[test]
    fn test_difficulty_one_is_diff1() {
        assert_eq!(Target::from_difficulty(1.0), Target::from_compact(DIFF1_BITS));
    }

    #[test]
    fn test_difficulty_scaling() {
        let diff1 = Target::from_compact(DIFF1_BITS);
        let harder = Target::from_difficulty(256.0);
        // 0xffff * 2^208 / 256 = 0xffff * 2^200
        assert_eq!(harder.0[25], 0xff);
        assert_eq!(harder.0[26], 0xff);
        assert_eq!(harder.0[27], 0x00);
        assert_eq!(le_cmp(&harder.0, &diff1.0), std::cmp::Ordering::Less);

        let easier = Target::from_difficulty(0.5);
        assert_eq!(le_cmp(&easier.0, &diff1.0), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_difficulty_degenerate_inputs() {
        assert_eq!(Target::from_difficulty(0.0), Target::MAX);
        assert_eq!(Target::from_difficulty(-3.0), Target::MAX);
        assert_eq!(Target::from_difficulty(f64::NAN), Target::MAX);
        assert_eq!(Target::from_difficulty(1e-30), Target::MAX);
        assert_eq!(Target::from_difficulty(f64::INFINITY), Target::ZERO);
    }

    proptest! {
        #[test]
        fn compact_matches_shifted_mantissa(exponent in 3u32..=16, mantissa in 0u32..0x0100_0000) {
            let bits = (exponent << 24) | mantissa;
            let target = Target::from_compact(bits);
            let expected = (mantissa as u128) << (8 * (exponent - 3));

            prop_assert_eq!(&target.0[..16], &expected.to_le_bytes()[..]);
            prop_assert!(target.0[16..].iter().all(|b| *b == 0));
            prop_assert_eq!(target, Target::from_compact(bits));
        }

        #[test]
        fn meets_target_agrees_with_numeric_order(hash in any::<[u8; 32]>(), target in any::<[u8; 32]>()) {
            let expected = le_cmp(&hash, &target) != std::cmp::Ordering::Greater;
            prop_assert_eq!(meets_target(&Hash256(hash), &Target(target)), expected);
        }

        #[test]
        fn target_separates_ordered_hashes(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            let (h1, h2) = if le_cmp(&a, &b) == std::cmp::Ordering::Less { (a, b) } else { (b, a) };
            let t = Target(h1);
            prop_assert!(meets_target(&Hash256(h1), &t));
            prop_assert!(!meets_target(&Hash256(h2), &t));
        }
    }
}
