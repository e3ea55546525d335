//! Numeric stack values.
//!
//! A [`ScriptNum`] is constructed from a stack element under the minimal
//! encoding rules and serialized back to the unique shortest form. Arithmetic
//! is unbounded; the interpreter's limits apply to the encoded byte length,
//! not the value.

use core::cmp::Ordering;
use core::ops::{Add, Mul, Neg, Sub};

use num_bigint::BigInt;
use num_traits::{Signed, Zero};

use crate::bigint;
use crate::script::ScriptError;

/// Default maximum accepted byte length of a numeric operand.
pub const MAX_NUM_SIZE: usize = 100_000;

/// An integer decoded from, or destined for, the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptNum(BigInt);

impl ScriptNum {
    /// Decodes a stack element, enforcing `max_size` and minimal encoding.
    pub fn from_slice(bytes: &[u8], max_size: usize) -> Result<Self, ScriptError> {
        if bytes.len() > max_size {
            return Err(ScriptError::InvalidNumberRange);
        }
        if !bigint::is_minimally_encoded(bytes, max_size) {
            return Err(ScriptError::InvalidNumberRange);
        }
        Ok(ScriptNum(bigint::deserialize(bytes)))
    }

    /// Serializes to the minimal stack encoding.
    pub fn to_vec(&self) -> Vec<u8> {
        bigint::serialize(&self.0)
    }

    /// Clamps to the 32-bit signed range.
    pub fn to_i32(&self) -> i32 {
        bigint::to_i32_clamped(&self.0)
    }

    /// Clamps to the 64-bit signed range.
    pub fn to_i64(&self) -> i64 {
        bigint::to_i64_clamped(&self.0)
    }

    /// Interprets the value as an index in `[0, i32::MAX]`.
    pub fn to_index(&self) -> Option<usize> {
        if self.0.is_negative() || self.0 > BigInt::from(i32::MAX) {
            return None;
        }
        Some(bigint::to_i32_clamped(&self.0) as usize)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn abs(&self) -> ScriptNum {
        ScriptNum(self.0.abs())
    }

    /// Integer division truncating toward zero. `None` when `divisor` is zero.
    pub fn checked_div(&self, divisor: &ScriptNum) -> Option<ScriptNum> {
        if divisor.0.is_zero() {
            return None;
        }
        Some(ScriptNum(&self.0 / &divisor.0))
    }

    /// Remainder with the sign of the dividend. `None` when `divisor` is zero.
    pub fn checked_rem(&self, divisor: &ScriptNum) -> Option<ScriptNum> {
        if divisor.0.is_zero() {
            return None;
        }
        Some(ScriptNum(&self.0 % &divisor.0))
    }

    pub fn bitand_i64(&self, mask: i64) -> ScriptNum {
        ScriptNum(&self.0 & &BigInt::from(mask))
    }

    pub fn into_inner(self) -> BigInt {
        self.0
    }
}

impl From<i64> for ScriptNum {
    fn from(n: i64) -> Self {
        ScriptNum(BigInt::from(n))
    }
}

impl From<u64> for ScriptNum {
    fn from(n: u64) -> Self {
        ScriptNum(BigInt::from(n))
    }
}

impl From<i32> for ScriptNum {
    fn from(n: i32) -> Self {
        ScriptNum(BigInt::from(n))
    }
}

impl From<u32> for ScriptNum {
    fn from(n: u32) -> Self {
        ScriptNum(BigInt::from(n))
    }
}

impl From<usize> for ScriptNum {
    fn from(n: usize) -> Self {
        ScriptNum(BigInt::from(n))
    }
}

impl From<BigInt> for ScriptNum {
    fn from(n: BigInt) -> Self {
        ScriptNum(n)
    }
}

impl PartialOrd for ScriptNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScriptNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialEq<i64> for ScriptNum {
    fn eq(&self, other: &i64) -> bool {
        self.0 == BigInt::from(*other)
    }
}

impl PartialOrd<i64> for ScriptNum {
    fn partial_cmp(&self, other: &i64) -> Option<Ordering> {
        self.0.partial_cmp(&BigInt::from(*other))
    }
}

impl Add for &ScriptNum {
    type Output = ScriptNum;

    fn add(self, rhs: &ScriptNum) -> ScriptNum {
        ScriptNum(&self.0 + &rhs.0)
    }
}

impl Sub for &ScriptNum {
    type Output = ScriptNum;

    fn sub(self, rhs: &ScriptNum) -> ScriptNum {
        ScriptNum(&self.0 - &rhs.0)
    }
}

impl Mul for &ScriptNum {
    type Output = ScriptNum;

    fn mul(self, rhs: &ScriptNum) -> ScriptNum {
        ScriptNum(&self.0 * &rhs.0)
    }
}

impl Neg for &ScriptNum {
    type Output = ScriptNum;

    fn neg(self) -> ScriptNum {
        ScriptNum(-&self.0)
    }
}
