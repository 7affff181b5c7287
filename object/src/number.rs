use crate::{ClassId, HeaderCell, TypeTag, Value, WORD_SIZE};

/// An IEEE-754 64-bit float.
///
/// ```text
/// [header 8B] [payload: f64 8B]
/// ```
#[repr(C)]
pub struct Double {
    pub header: HeaderCell,
    value: f64,
}

const _: () = assert!(size_of::<Double>() == 2 * WORD_SIZE);

/// # Safety
///
/// `ptr` must point at [`Double::allocation_size`]`()` word-aligned bytes.
pub unsafe fn init_double(ptr: *mut u8, class_id: ClassId, value: f64) -> Value {
    // SAFETY: the caller hands us a large enough allocation.
    unsafe {
        let double = &mut *(ptr as *mut Double);
        double.header = HeaderCell::new(TypeTag::Double, class_id);
        double.value = value;
    }
    Value::from_ptr(ptr)
}

impl Double {
    pub const fn allocation_size() -> usize {
        size_of::<Double>()
    }

    #[inline(always)]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[inline(always)]
    pub fn bits(&self) -> i64 {
        self.value.to_bits() as i64
    }

    pub(crate) fn set_value(&mut self, value: f64) {
        self.value = value;
    }
}

/// A 64-bit integer that does not fit the smi range.
///
/// ```text
/// [header 8B] [payload: i64 8B]
/// ```
#[repr(C)]
pub struct LargeInteger {
    pub header: HeaderCell,
    value: i64,
}

const _: () = assert!(size_of::<LargeInteger>() == 2 * WORD_SIZE);

/// # Safety
///
/// `ptr` must point at [`LargeInteger::allocation_size`]`()` word-aligned
/// bytes; `value` must be outside the smi range.
pub unsafe fn init_large_integer(ptr: *mut u8, class_id: ClassId, value: i64) -> Value {
    debug_assert!(!Value::is_valid(value), "smi-representable large integer");
    // SAFETY: the caller hands us a large enough allocation.
    unsafe {
        let large = &mut *(ptr as *mut LargeInteger);
        large.header = HeaderCell::new(TypeTag::LargeInteger, class_id);
        large.value = value;
    }
    Value::from_ptr(ptr)
}

impl LargeInteger {
    pub const fn allocation_size() -> usize {
        size_of::<LargeInteger>()
    }

    #[inline(always)]
    pub fn value(&self) -> i64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DOUBLE_CLASS_ID, LARGE_INTEGER_CLASS_ID, MAX_SMI_VALUE};

    #[test]
    fn double_payload_round_trip() {
        let mut backing = vec![0u64; 2];
        let v = unsafe {
            init_double(backing.as_mut_ptr() as *mut u8, DOUBLE_CLASS_ID, 2.5)
        };
        let d: &Double = unsafe { v.as_obj() };
        assert_eq!(d.value(), 2.5);
        assert_eq!(d.bits(), 2.5f64.to_bits() as i64);
        assert_eq!(d.header.tag(), TypeTag::Double);
    }

    #[test]
    fn large_integer_payload() {
        let mut backing = vec![0u64; 2];
        let v = unsafe {
            init_large_integer(
                backing.as_mut_ptr() as *mut u8,
                LARGE_INTEGER_CLASS_ID,
                MAX_SMI_VALUE + 1,
            )
        };
        let large: &LargeInteger = unsafe { v.as_obj() };
        assert_eq!(large.value(), MAX_SMI_VALUE + 1);
        assert_eq!(large.header.tag(), TypeTag::LargeInteger);
    }
}
