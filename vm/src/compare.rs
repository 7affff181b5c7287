//! The typed numeric comparison shared with the bytecode set.
//!
//! [`compare_numbers`] packs two encodings into one word: a compact
//! `{-1, 0, +1}` result under [`COMPARE_TO_MASK`] (biased by
//! [`COMPARE_TO_BIAS`]) for the fast paths, and coarse outcome flags for
//! the branch bytecodes. The encoding is wire-stable.

use object::{Double, LargeInteger, TypeTag, Value};

use bitflags::bitflags;

/// Either side was not a number.
pub const COMPARISON_FAILED: i64 = 0;

pub const COMPARE_TO_BIAS: i64 = -2;
pub const COMPARE_TO_MINUS_1: i64 = 1;
pub const COMPARE_TO_ZERO: i64 = 2;
pub const COMPARE_TO_PLUS_1: i64 = 3;
pub const COMPARE_TO_MASK: i64 = 3;

bitflags! {
    /// Coarse comparison outcome bits, or-ed onto the compact encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompareFlags: i64 {
        /// Signals `min` that the left side wins with the special rule
        /// that NaN sorts below anything. (`max` needs no such bit:
        /// NaN already sorts high in the total order used here.)
        const LESS_FOR_MIN    = 4;
        const STRICTLY_LESS   = 8;
        const LESS_EQUAL      = 16;
        const EQUAL           = 32;
        const GREATER_EQUAL   = 64;
        const STRICTLY_GREATER = 128;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(f) => f,
        }
    }
}

/// Extract the numeric payload of a smi, large integer, or double.
///
/// # Safety
///
/// If `value` is a heap pointer it must point at a live object.
pub(crate) unsafe fn extract(value: Value) -> Option<Number> {
    if let Some(n) = value.as_smi() {
        return Some(Number::Int(n));
    }
    if !value.is_heap_object() {
        return None;
    }
    // SAFETY: reinterpretation guarded by the class tag.
    unsafe {
        match object::class_tag(value) {
            TypeTag::LargeInteger => Some(Number::Int(value.as_obj::<LargeInteger>().value())),
            TypeTag::Double => Some(Number::Float(value.as_obj::<Double>().value())),
            _ => None,
        }
    }
}

#[inline(always)]
fn packed_less() -> i64 {
    COMPARE_TO_MINUS_1 | (CompareFlags::STRICTLY_LESS | CompareFlags::LESS_EQUAL).bits()
}

#[inline(always)]
fn packed_equal() -> i64 {
    COMPARE_TO_ZERO
        | (CompareFlags::LESS_EQUAL | CompareFlags::EQUAL | CompareFlags::GREATER_EQUAL).bits()
}

#[inline(always)]
fn packed_greater() -> i64 {
    COMPARE_TO_PLUS_1
        | (CompareFlags::GREATER_EQUAL | CompareFlags::STRICTLY_GREATER).bits()
}

/// Compare two numbers, returning the packed result word.
/// [`COMPARISON_FAILED`] if either side is not a smi, large integer, or
/// double.
///
/// Doubles use the IEEE total order with NaN sorting high; the
/// `LESS_FOR_MIN` bit fires exactly when the left side is NaN, so `min`
/// propagates NaN without a second comparison.
///
/// # Safety
///
/// Heap operands must point at live objects.
pub unsafe fn compare_numbers(lhs: Value, rhs: Value) -> i64 {
    // Smi fast path.
    if let (Some(a), Some(b)) = (lhs.as_smi(), rhs.as_smi()) {
        return compare_ints(a, b);
    }
    // SAFETY: forwarded contract.
    let (a, b) = unsafe {
        match (extract(lhs), extract(rhs)) {
            (Some(a), Some(b)) => (a, b),
            _ => return COMPARISON_FAILED,
        }
    };
    match (a, b) {
        (Number::Int(a), Number::Int(b)) => compare_ints(a, b),
        (Number::Int(a), Number::Float(b)) => compare_floats(a as f64, b),
        (Number::Float(a), Number::Int(b)) => compare_floats(a, b as f64),
        (Number::Float(a), Number::Float(b)) => compare_floats(a, b),
    }
}

fn compare_ints(a: i64, b: i64) -> i64 {
    if a < b {
        packed_less()
    } else if a == b {
        packed_equal()
    } else {
        packed_greater()
    }
}

fn compare_floats(a: f64, b: f64) -> i64 {
    if a.is_nan() {
        let base = if b.is_nan() { packed_equal() } else { packed_greater() };
        return base | CompareFlags::LESS_FOR_MIN.bits();
    }
    if b.is_nan() {
        // NaN sorts high, so a non-NaN left side is strictly less.
        return packed_less();
    }
    if a < b {
        packed_less()
    } else if a == b {
        packed_equal()
    } else {
        packed_greater()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::process::tests::tiny_program;

    fn flags(packed: i64) -> CompareFlags {
        CompareFlags::from_bits_truncate(packed & !COMPARE_TO_MASK)
    }

    fn compact(packed: i64) -> i64 {
        (packed & COMPARE_TO_MASK) + COMPARE_TO_BIAS
    }

    #[test]
    fn smi_fast_path_matches_the_stable_encoding() {
        let packed = unsafe { compare_numbers(Value::from_smi(3), Value::from_smi(4)) };
        assert_eq!(packed, 25, "minus-one encoding plus strict-less and less-equal");
        assert_eq!(compact(packed), -1);
        assert_eq!(flags(packed), CompareFlags::STRICTLY_LESS | CompareFlags::LESS_EQUAL);

        let equal = unsafe { compare_numbers(Value::from_smi(4), Value::from_smi(4)) };
        assert_eq!(compact(equal), 0);
        assert!(flags(equal).contains(CompareFlags::EQUAL | CompareFlags::LESS_EQUAL));
        assert!(!flags(equal).contains(CompareFlags::STRICTLY_LESS));

        let greater = unsafe { compare_numbers(Value::from_smi(5), Value::from_smi(4)) };
        assert_eq!(compact(greater), 1);
        assert!(flags(greater).contains(CompareFlags::STRICTLY_GREATER));
    }

    #[test]
    fn non_numbers_fail() {
        let process = Process::new(1, tiny_program());
        let not_a_number = process.roots.true_object;
        unsafe {
            assert_eq!(compare_numbers(not_a_number, Value::from_smi(1)), COMPARISON_FAILED);
            assert_eq!(compare_numbers(Value::from_smi(1), not_a_number), COMPARISON_FAILED);
        }
    }

    #[test]
    fn mixed_widths_compare_numerically() {
        let mut process = Process::new(1, tiny_program());
        let big = process.allocate_large_integer(object::MAX_SMI_VALUE + 1).unwrap();
        let half = process.allocate_double(0.5).unwrap();
        unsafe {
            assert_eq!(compact(compare_numbers(Value::from_smi(1), big)), -1);
            assert_eq!(compact(compare_numbers(big, Value::from_smi(1))), 1);
            assert_eq!(compact(compare_numbers(half, Value::from_smi(1))), -1);
            assert_eq!(compact(compare_numbers(Value::from_smi(0), half)), -1);
        }
    }

    #[test]
    fn nan_sorts_high_and_flags_min() {
        let mut process = Process::new(1, tiny_program());
        let nan = process.allocate_double(f64::NAN).unwrap();
        let one = process.allocate_double(1.0).unwrap();

        let left_nan = unsafe { compare_numbers(nan, one) };
        assert_eq!(compact(left_nan), 1, "NaN sorts above everything");
        assert!(flags(left_nan).contains(CompareFlags::LESS_FOR_MIN));

        let right_nan = unsafe { compare_numbers(one, nan) };
        assert_eq!(compact(right_nan), -1);
        assert!(!flags(right_nan).contains(CompareFlags::LESS_FOR_MIN));

        let both = unsafe { compare_numbers(nan, nan) };
        assert_eq!(compact(both), 0);
        assert!(flags(both).contains(CompareFlags::LESS_FOR_MIN));
    }

    #[test]
    fn zero_signs_compare_equal() {
        let mut process = Process::new(1, tiny_program());
        let neg = process.allocate_double(-0.0).unwrap();
        let pos = process.allocate_double(0.0).unwrap();
        let packed = unsafe { compare_numbers(neg, pos) };
        assert_eq!(compact(packed), 0);
    }
}
