use crate::{ClassId, HeaderCell, TypeTag, Value, WORD_SIZE, align_up};

/// External tag for plain byte content. Only this tag allows byte-content
/// extraction; other tags mark driver-owned struct payloads.
pub const RAW_BYTE_TAG: u64 = 1;
/// External tag of a neutered byte array.
pub const NULL_STRUCT_TAG: u64 = 0;

/// A variable-length byte buffer with two representations.
///
/// ```text
/// internal: [header 8B] [length: i64 >= 0] [byte_0] [byte_1] ... [pad]
/// external: [header 8B] [-1-length: i64]   [address: u64] [tag: u64]
/// ```
///
/// A negative length field encodes the external form. External storage is
/// single-owner; [`ByteArray::neuter`] detaches it and hands the buffer
/// back to the caller.
#[repr(C)]
pub struct ByteArray {
    pub header: HeaderCell,
    raw_length: i64,
}

const _: () = assert!(size_of::<ByteArray>() == 2 * WORD_SIZE);

const EXTERNAL_ADDRESS_OFFSET: usize = size_of::<ByteArray>();
const EXTERNAL_TAG_OFFSET: usize = EXTERNAL_ADDRESS_OFFSET + WORD_SIZE;
const EXTERNAL_SIZE: usize = EXTERNAL_TAG_OFFSET + WORD_SIZE;

/// Write a fresh internal byte array into `ptr`. Content stays zeroed.
///
/// # Safety
///
/// `ptr` must point at [`ByteArray::internal_allocation_size`]`(length)`
/// zeroed, word-aligned bytes.
pub unsafe fn init_byte_array(ptr: *mut u8, class_id: ClassId, length: usize) -> Value {
    // SAFETY: the caller hands us a large enough zeroed allocation.
    unsafe {
        let bytes = &mut *(ptr as *mut ByteArray);
        bytes.header = HeaderCell::new(TypeTag::ByteArray, class_id);
        bytes.raw_length = length as i64;
    }
    Value::from_ptr(ptr)
}

/// Write a fresh external byte array into `ptr`, taking ownership of
/// `address`.
///
/// # Safety
///
/// `ptr` must point at [`ByteArray::external_allocation_size`]`()` zeroed,
/// word-aligned bytes; `address` must stay valid for `length` bytes until
/// the array is neutered or collected.
pub unsafe fn init_external_byte_array(
    ptr: *mut u8,
    class_id: ClassId,
    length: usize,
    address: *mut u8,
    tag: u64,
) -> Value {
    // SAFETY: the caller hands us a large enough allocation.
    unsafe {
        let bytes = &mut *(ptr as *mut ByteArray);
        bytes.header = HeaderCell::new(TypeTag::ByteArray, class_id);
        bytes.raw_length = -1 - length as i64;
        bytes.set_external_address(address);
        bytes.set_external_tag(tag);
    }
    Value::from_ptr(ptr)
}

impl ByteArray {
    pub const fn internal_allocation_size(length: usize) -> usize {
        align_up(size_of::<ByteArray>() + length)
    }

    pub const fn external_allocation_size() -> usize {
        EXTERNAL_SIZE
    }

    #[inline(always)]
    pub fn raw_length(&self) -> i64 {
        self.raw_length
    }

    #[inline(always)]
    pub fn has_external_address(&self) -> bool {
        self.raw_length < 0
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        if self.raw_length >= 0 {
            self.raw_length as usize
        } else {
            (-1 - self.raw_length) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> usize {
        if self.has_external_address() {
            Self::external_allocation_size()
        } else {
            Self::internal_allocation_size(self.raw_length as usize)
        }
    }

    #[inline(always)]
    fn word_at(&self, offset: usize) -> u64 {
        // SAFETY: offset is one of the fixed external-field offsets, which
        // lie within the allocation when the array is external.
        unsafe { *((self as *const Self as *const u8).add(offset) as *const u64) }
    }

    #[inline(always)]
    fn word_at_put(&mut self, offset: usize, value: u64) {
        // SAFETY: same bounds argument as `word_at`.
        unsafe { *((self as *mut Self as *mut u8).add(offset) as *mut u64) = value }
    }

    pub fn external_tag(&self) -> u64 {
        assert!(self.has_external_address());
        self.word_at(EXTERNAL_TAG_OFFSET)
    }

    fn external_address(&self) -> *mut u8 {
        debug_assert!(self.has_external_address());
        self.word_at(EXTERNAL_ADDRESS_OFFSET) as *mut u8
    }

    fn set_external_address(&mut self, address: *mut u8) {
        debug_assert!(self.has_external_address());
        self.word_at_put(EXTERNAL_ADDRESS_OFFSET, address as u64);
    }

    fn set_external_tag(&mut self, tag: u64) {
        debug_assert!(self.has_external_address());
        self.word_at_put(EXTERNAL_TAG_OFFSET, tag);
    }

    #[inline(always)]
    fn content_ptr(&self) -> *mut u8 {
        if self.has_external_address() {
            self.external_address()
        } else {
            (self as *const Self).wrapping_add(1) as *mut u8
        }
    }

    /// The byte content. External arrays must carry the raw-byte tag.
    pub fn bytes(&self) -> &[u8] {
        if self.has_external_address() {
            assert_eq!(self.external_tag(), RAW_BYTE_TAG);
        }
        // SAFETY: len bytes live at the content address in both forms.
        unsafe { core::slice::from_raw_parts(self.content_ptr(), self.len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        if self.has_external_address() {
            assert_eq!(self.external_tag(), RAW_BYTE_TAG);
        }
        // SAFETY: len bytes live at the content address in both forms.
        unsafe { core::slice::from_raw_parts_mut(self.content_ptr(), self.len()) }
    }

    /// Detach the external buffer: the array becomes an empty external
    /// array and the caller takes over ownership of the returned
    /// `(address, length)`. The caller is also responsible for
    /// unregistering the allocation from the owning process.
    pub fn neuter(&mut self) -> (*mut u8, usize) {
        assert!(self.has_external_address());
        assert_eq!(self.external_tag(), RAW_BYTE_TAG);
        let address = self.external_address();
        let length = self.len();
        self.raw_length = -1;
        self.set_external_address(core::ptr::null_mut());
        self.set_external_tag(NULL_STRUCT_TAG);
        (address, length)
    }

    /// Shrink an internal byte array in place. Only valid for the most
    /// recent allocation; the freed tail is handed back by the caller's
    /// allocator.
    pub fn shrink(&mut self, new_length: usize) {
        assert!(!self.has_external_address());
        assert!(new_length <= self.raw_length as usize);
        self.raw_length = new_length as i64;
    }

    /// Visit the raw external pointer, if any.
    pub fn do_pointers(&mut self, cb: &mut dyn FnMut(&mut u64)) {
        if self.has_external_address() {
            // SAFETY: the external-address word is in bounds for the
            // external form.
            let slot = unsafe {
                &mut *((self as *mut Self as *mut u8).add(EXTERNAL_ADDRESS_OFFSET) as *mut u64)
            };
            cb(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BYTE_ARRAY_CLASS_ID;

    fn raw_internal(length: usize) -> (Vec<u64>, Value) {
        let words = ByteArray::internal_allocation_size(length) / WORD_SIZE;
        let mut backing = vec![0u64; words];
        let v = unsafe {
            init_byte_array(backing.as_mut_ptr() as *mut u8, BYTE_ARRAY_CLASS_ID, length)
        };
        (backing, v)
    }

    #[test]
    fn internal_length_and_content() {
        let (_backing, v) = raw_internal(5);
        let bytes: &mut ByteArray = unsafe { v.as_obj_mut() };
        assert!(!bytes.has_external_address());
        assert_eq!(bytes.len(), 5);
        bytes.bytes_mut()[3] = 0xAB;
        assert_eq!(bytes.bytes()[3], 0xAB);
        assert_eq!(bytes.bytes()[0], 0, "fresh content must be zeroed");
    }

    #[test]
    fn external_encoding_uses_negative_length() {
        let mut buffer = vec![1u8, 2, 3, 4];
        let mut backing = vec![0u64; ByteArray::external_allocation_size() / WORD_SIZE];
        let v = unsafe {
            init_external_byte_array(
                backing.as_mut_ptr() as *mut u8,
                BYTE_ARRAY_CLASS_ID,
                buffer.len(),
                buffer.as_mut_ptr(),
                RAW_BYTE_TAG,
            )
        };
        let bytes: &ByteArray = unsafe { v.as_obj() };
        assert!(bytes.has_external_address());
        assert_eq!(bytes.raw_length(), -5);
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes.bytes(), &[1, 2, 3, 4]);
        assert_eq!(bytes.size(), ByteArray::external_allocation_size());
    }

    #[test]
    fn neuter_detaches_ownership() {
        let mut buffer = vec![9u8; 16];
        let address = buffer.as_mut_ptr();
        let mut backing = vec![0u64; ByteArray::external_allocation_size() / WORD_SIZE];
        let v = unsafe {
            init_external_byte_array(
                backing.as_mut_ptr() as *mut u8,
                BYTE_ARRAY_CLASS_ID,
                buffer.len(),
                address,
                RAW_BYTE_TAG,
            )
        };
        let bytes: &mut ByteArray = unsafe { v.as_obj_mut() };
        let (detached, length) = bytes.neuter();
        assert_eq!(detached, address);
        assert_eq!(length, 16);
        assert_eq!(bytes.len(), 0);
        assert_eq!(bytes.external_tag(), NULL_STRUCT_TAG);
    }

    #[test]
    fn do_pointers_only_fires_for_external() {
        let (_backing, v) = raw_internal(3);
        let bytes: &mut ByteArray = unsafe { v.as_obj_mut() };
        let mut fired = 0;
        bytes.do_pointers(&mut |_| fired += 1);
        assert_eq!(fired, 0);

        let mut buffer = vec![0u8; 2];
        let mut ext_backing = vec![0u64; ByteArray::external_allocation_size() / WORD_SIZE];
        let ev = unsafe {
            init_external_byte_array(
                ext_backing.as_mut_ptr() as *mut u8,
                BYTE_ARRAY_CLASS_ID,
                buffer.len(),
                buffer.as_mut_ptr(),
                RAW_BYTE_TAG,
            )
        };
        let ext: &mut ByteArray = unsafe { ev.as_obj_mut() };
        ext.do_pointers(&mut |_| fired += 1);
        assert_eq!(fired, 1);
    }

    #[test]
    fn shrink_reduces_internal_length() {
        let (_backing, v) = raw_internal(8);
        let bytes: &mut ByteArray = unsafe { v.as_obj_mut() };
        bytes.shrink(3);
        assert_eq!(bytes.len(), 3);
    }
}
