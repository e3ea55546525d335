//! Arbitrary-precision script integers.
//!
//! Stack numerics are serialized as little-endian sign-magnitude byte
//! strings: the absolute value in little-endian order with the sign carried
//! in bit 7 of the most significant byte, appending an extra byte when that
//! bit would collide with a magnitude bit. The empty string encodes zero.

use num_bigint::{BigInt, Sign};
use num_traits::{Signed, ToPrimitive, Zero};

/// Serializes `value` to the script's sign-magnitude little-endian form.
pub fn serialize(value: &BigInt) -> Vec<u8> {
    if value.is_zero() {
        return Vec::new();
    }

    let negative = value.is_negative();
    let mut result = value.magnitude().to_bytes_le();

    let last = result
        .last_mut()
        .expect("non-zero magnitude has at least one byte");
    if *last & 0x80 != 0 {
        result.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *last |= 0x80;
    }

    result
}

/// Decodes the script's sign-magnitude little-endian form.
pub fn deserialize(bytes: &[u8]) -> BigInt {
    if bytes.is_empty() {
        return BigInt::zero();
    }

    let mut magnitude = bytes.to_vec();
    let last = magnitude.last_mut().expect("checked non-empty");
    let negative = *last & 0x80 != 0;
    *last &= 0x7f;

    let value = BigInt::from_bytes_le(Sign::Plus, &magnitude);
    if negative {
        -value
    } else {
        value
    }
}

/// Checks that `bytes` is the unique shortest encoding of its value.
///
/// The most significant byte may only have all magnitude bits clear when the
/// byte below it needs the full eight bits, i.e. its own top bit set.
pub fn is_minimally_encoded(bytes: &[u8], max_len: usize) -> bool {
    if bytes.len() > max_len {
        return false;
    }
    if let Some(&last) = bytes.last() {
        if last & 0x7f == 0 {
            // Also rejects negative zero (a bare 0x80).
            if bytes.len() <= 1 || bytes[bytes.len() - 2] & 0x80 == 0 {
                return false;
            }
        }
    }
    true
}

/// Rewrites `data` in place to its minimal encoding.
///
/// Returns `true` when the buffer was modified.
pub fn minimally_encode(data: &mut Vec<u8>) -> bool {
    let Some(&last) = data.last() else {
        return false;
    };

    if last & 0x7f != 0 {
        return false;
    }

    if data.len() == 1 {
        // A lone 0x00 or 0x80 is a zero, which encodes as the empty string.
        data.clear();
        return true;
    }

    if data[data.len() - 2] & 0x80 != 0 {
        return false;
    }

    for i in (1..data.len()).rev() {
        if data[i - 1] != 0 {
            if data[i - 1] & 0x80 != 0 {
                // The sign bit is occupied, keep one extra byte for it.
                data[i] = last;
                data.truncate(i + 1);
            } else {
                data[i - 1] |= last;
                data.truncate(i);
            }
            return true;
        }
    }

    data.clear();
    true
}

/// Converts to `i32`, clamping values outside the range to the nearest bound.
pub fn to_i32_clamped(value: &BigInt) -> i32 {
    value.to_i32().unwrap_or(if value.is_negative() {
        i32::MIN
    } else {
        i32::MAX
    })
}

/// Converts to `i64`, clamping values outside the range to the nearest bound.
pub fn to_i64_clamped(value: &BigInt) -> i64 {
    value.to_i64().unwrap_or(if value.is_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}
