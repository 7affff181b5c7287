//! The heap object model: tagged values, class headers, and the layouts
//! of every object kind the interpreter touches.

mod array;
mod bytearray;
mod catalog;
mod class;
mod header;
mod instance;
mod number;
mod snapshot;
mod stack;
mod string;
mod value;

pub use array::{Array, init_array};
pub use bytearray::{
    ByteArray, NULL_STRUCT_TAG, RAW_BYTE_TAG, init_byte_array, init_external_byte_array,
};
pub use catalog::{
    BlobKind, HeapObject, byte_content, class_tag, do_pointers, is_array, is_byte_array,
    is_double, is_instance, is_large_integer, is_stack, is_string, is_task, roots_do, size_of,
};
pub use class::{
    ARRAY_CLASS_ID, BYTE_ARRAY_CLASS_ID, BYTE_ARRAY_COW_CLASS_ID, BYTE_ARRAY_SLICE_CLASS_ID,
    ClassInfo, ClassTable, DOUBLE_CLASS_ID, FALSE_CLASS_ID, LARGE_INTEGER_CLASS_ID,
    NULL_CLASS_ID, STACK_CLASS_ID, STRING_CLASS_ID, STRING_SLICE_CLASS_ID, TASK_CLASS_ID,
    TRUE_CLASS_ID, WORD_SIZE, align_up,
};
pub use header::{ClassId, Header, HeaderCell, HeaderWord, TypeTag};
pub use instance::{Instance, Task, init_instance};
pub use number::{Double, LargeInteger, init_double, init_large_integer};
pub use snapshot::{
    SNAPSHOT_INTERNAL_SIZE_CUTOFF, SnapshotError, SnapshotReader, SnapshotWriter, ValueReader,
    ValueWriter,
};
pub use stack::{
    BLOCK_SALT, CodeBounds, FrameSkip, OVERFLOW_HEADROOM, STACK_INITIAL_LENGTH,
    STACK_MAX_LENGTH, Stack, StackRegisters, from_block, init_stack, looks_like_block, to_block,
};
pub use string::{NO_HASH_CODE, Str, compare_bytes, compute_hash_code_for, init_string,
    init_external_string,
};
pub use value::{IntegerTooLarge, MAX_SMI_VALUE, MIN_SMI_VALUE, Value};
