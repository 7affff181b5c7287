//! Kind dispatch over the heap object catalog.
//!
//! Every function here takes an untagged cell address or a heap-tagged
//! [`Value`] and dispatches on the class tag in the header. All of them
//! require the pointed-at cell to be a valid, live heap object; the
//! scavenger additionally requires that the header has not yet been
//! replaced by a forwarding pointer.

use crate::{
    Array, ByteArray, BYTE_ARRAY_COW_CLASS_ID, BYTE_ARRAY_SLICE_CLASS_ID, ClassTable, CodeBounds,
    Double, HeaderCell, Instance, LargeInteger, RAW_BYTE_TAG, Stack, Str, STRING_SLICE_CLASS_ID,
    TypeTag, Value,
};

/// The generic prefix every heap object starts with.
#[repr(C)]
pub struct HeapObject {
    pub header: HeaderCell,
}

/// The class tag of a heap value.
///
/// # Safety
///
/// `value` must be a heap pointer to a live object whose header is not a
/// forwarding pointer.
#[inline(always)]
pub unsafe fn class_tag(value: Value) -> TypeTag {
    // SAFETY: every heap object starts with a header cell.
    unsafe { value.as_obj::<HeapObject>().header.tag() }
}

macro_rules! tag_predicate {
    ($name:ident, $tag:ident) => {
        /// # Safety
        ///
        /// If `value` is a heap pointer it must point at a live object.
        #[inline(always)]
        pub unsafe fn $name(value: Value) -> bool {
            // SAFETY: forwarded to `class_tag`.
            value.is_heap_object() && unsafe { class_tag(value) } == TypeTag::$tag
        }
    };
}

tag_predicate!(is_array, Array);
tag_predicate!(is_byte_array, ByteArray);
tag_predicate!(is_string, String);
tag_predicate!(is_double, Double);
tag_predicate!(is_large_integer, LargeInteger);
tag_predicate!(is_instance, Instance);
tag_predicate!(is_stack, Stack);
tag_predicate!(is_task, Task);

/// The total byte size of the object at `addr`.
///
/// Fixed-size kinds are constant, variable-size kinds read their length
/// field, and instances read the program's per-class size table.
///
/// # Safety
///
/// `addr` must point at a live heap object whose header is intact.
pub unsafe fn size_of(addr: *const u8, table: &ClassTable) -> usize {
    // SAFETY: dispatch below only reinterprets `addr` as the layout the
    // class tag promises.
    unsafe {
        let header = (*(addr as *const HeapObject)).header;
        match header.tag() {
            TypeTag::Array => (*(addr as *const Array)).size(),
            TypeTag::ByteArray => (*(addr as *const ByteArray)).size(),
            TypeTag::String => (*(addr as *const Str)).size(),
            TypeTag::Stack => (*(addr as *const Stack)).size(),
            TypeTag::Double => Double::allocation_size(),
            TypeTag::LargeInteger => LargeInteger::allocation_size(),
            TypeTag::Instance | TypeTag::Task | TypeTag::Oddball => {
                table.instance_size_for(header.class_id())
            }
        }
    }
}

/// Visit the address of every value slot of the object at `addr`.
///
/// # Safety
///
/// `addr` must point at a live heap object whose header is intact. Stacks
/// must be heap-resident (not transferred to the interpreter).
pub unsafe fn roots_do(
    addr: *mut u8,
    table: &ClassTable,
    bounds: &CodeBounds,
    cb: &mut dyn FnMut(&mut Value),
) {
    // SAFETY: dispatch below only reinterprets `addr` as the layout the
    // class tag promises.
    unsafe {
        let header = (*(addr as *const HeapObject)).header;
        match header.tag() {
            TypeTag::Array => (*(addr as *mut Array)).roots_do(cb),
            TypeTag::Stack => {
                let stack = &mut *(addr as *mut Stack);
                cb(stack.task_slot_mut());
                stack.roots_do(bounds, cb);
            }
            TypeTag::Instance | TypeTag::Task | TypeTag::Oddball => {
                let size = table.instance_size_for(header.class_id());
                (*(addr as *mut Instance)).roots_do(size, cb);
            }
            TypeTag::String
            | TypeTag::Double
            | TypeTag::LargeInteger
            | TypeTag::ByteArray => {
                // No value slots beyond the header.
            }
        }
    }
}

/// Visit every raw external pointer of the object at `addr`. Only byte
/// arrays with external storage have any.
///
/// # Safety
///
/// `addr` must point at a live heap object whose header is intact.
pub unsafe fn do_pointers(addr: *mut u8, cb: &mut dyn FnMut(&mut u64)) {
    // SAFETY: byte-array reinterpretation guarded by the class tag.
    unsafe {
        let header = (*(addr as *const HeapObject)).header;
        if header.tag() == TypeTag::ByteArray {
            (*(addr as *mut ByteArray)).do_pointers(cb);
        }
    }
}

/// What receivers read-only byte extraction accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    StringsOrByteArrays,
    StringsOnly,
}

/// Read-only byte content of strings, byte arrays, COW byte arrays, and
/// slices. Fails cleanly (returns `None`) for struct-tagged external byte
/// arrays, non-smi slice bounds, out-of-range bounds, and receivers that
/// are not byte-like.
///
/// # Safety
///
/// Every heap value reachable from `value` must point at a live object.
pub unsafe fn byte_content<'a>(
    value: Value,
    table: &ClassTable,
    kind: BlobKind,
) -> Option<&'a [u8]> {
    if !value.is_heap_object() {
        return None;
    }
    // SAFETY: per-kind reinterpretation guarded by the class tag.
    unsafe {
        let header = value.as_obj::<HeapObject>().header;
        match header.tag() {
            TypeTag::String => Some(value.as_obj::<Str>().bytes()),
            TypeTag::ByteArray if kind == BlobKind::StringsOrByteArrays => {
                let bytes = value.as_obj::<ByteArray>();
                if bytes.has_external_address() && bytes.external_tag() != RAW_BYTE_TAG {
                    return None;
                }
                Some(bytes.bytes())
            }
            TypeTag::Instance => {
                let class_id = header.class_id();
                if kind == BlobKind::StringsOrByteArrays && class_id == BYTE_ARRAY_COW_CLASS_ID {
                    let backing = value.as_obj::<Instance>().at(0);
                    return byte_content(backing, table, kind);
                }
                let is_slice = (kind == BlobKind::StringsOrByteArrays
                    && class_id == BYTE_ARRAY_SLICE_CLASS_ID)
                    || class_id == STRING_SLICE_CLASS_ID;
                if !is_slice {
                    return None;
                }
                let instance = value.as_obj::<Instance>();
                let wrapped = instance.at(0);
                let from = instance.at(1).as_smi()?;
                let to = instance.at(2).as_smi()?;
                let inner = byte_content(wrapped, table, kind)?;
                if 0 <= from && from <= to && to as usize <= inner.len() {
                    Some(&inner[from as usize..to as usize])
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
