use crate::{ClassId, TypeTag};

/// Bytes per slot.
pub const WORD_SIZE: usize = 8;

/// Round a byte size up to the next word boundary.
#[inline(always)]
pub const fn align_up(byte_size: usize) -> usize {
    (byte_size + (WORD_SIZE - 1)) & !(WORD_SIZE - 1)
}

/// Per-class metadata: the kind tag and, for fixed-size kinds, the total
/// byte size of an instance. Variable-size kinds store 0 and compute their
/// size from their length field.
#[derive(Debug, Clone, Copy)]
pub struct ClassInfo {
    pub tag: TypeTag,
    pub instance_size: u32,
}

/// The program-wide class table, indexed by [`ClassId`].
///
/// The first entries are the built-in runtime classes in a fixed order;
/// user-defined instance classes are appended after them.
#[derive(Debug, Clone)]
pub struct ClassTable {
    infos: Vec<ClassInfo>,
}

pub const NULL_CLASS_ID: ClassId = 0;
pub const TRUE_CLASS_ID: ClassId = 1;
pub const FALSE_CLASS_ID: ClassId = 2;
pub const ARRAY_CLASS_ID: ClassId = 3;
pub const BYTE_ARRAY_CLASS_ID: ClassId = 4;
pub const STRING_CLASS_ID: ClassId = 5;
pub const DOUBLE_CLASS_ID: ClassId = 6;
pub const LARGE_INTEGER_CLASS_ID: ClassId = 7;
pub const STACK_CLASS_ID: ClassId = 8;
pub const TASK_CLASS_ID: ClassId = 9;
pub const BYTE_ARRAY_COW_CLASS_ID: ClassId = 10;
pub const BYTE_ARRAY_SLICE_CLASS_ID: ClassId = 11;
pub const STRING_SLICE_CLASS_ID: ClassId = 12;

const BUILTIN_COUNT: usize = 13;

impl ClassTable {
    /// A table holding exactly the built-in runtime classes.
    pub fn with_builtins() -> Self {
        let header = WORD_SIZE as u32;
        let word = WORD_SIZE as u32;
        let fixed = |tag, fields: u32| ClassInfo {
            tag,
            instance_size: header + fields * word,
        };
        let variable = |tag| ClassInfo { tag, instance_size: 0 };

        let infos = vec![
            fixed(TypeTag::Oddball, 0),  // null
            fixed(TypeTag::Oddball, 0),  // true
            fixed(TypeTag::Oddball, 0),  // false
            variable(TypeTag::Array),
            variable(TypeTag::ByteArray),
            variable(TypeTag::String),
            fixed(TypeTag::Double, 1),
            fixed(TypeTag::LargeInteger, 1),
            variable(TypeTag::Stack),
            fixed(TypeTag::Task, 3),     // stack, id, result
            fixed(TypeTag::Instance, 2), // COW byte array: backing, mutable
            fixed(TypeTag::Instance, 3), // byte array slice: backing, from, to
            fixed(TypeTag::Instance, 3), // string slice: backing, from, to
        ];
        debug_assert_eq!(infos.len(), BUILTIN_COUNT);
        Self { infos }
    }

    /// Append a user instance class with `field_count` value slots.
    pub fn register_instance_class(&mut self, field_count: u32) -> ClassId {
        let id = self.infos.len() as ClassId;
        self.infos.push(ClassInfo {
            tag: TypeTag::Instance,
            instance_size: (WORD_SIZE as u32) * (1 + field_count),
        });
        id
    }

    #[inline(always)]
    pub fn info(&self, id: ClassId) -> ClassInfo {
        self.infos[id as usize]
    }

    #[inline(always)]
    pub fn tag_for(&self, id: ClassId) -> TypeTag {
        self.info(id).tag
    }

    /// Total byte size of an instance of class `id`. Zero for
    /// variable-size kinds.
    #[inline(always)]
    pub fn instance_size_for(&self, id: ClassId) -> usize {
        self.info(id).instance_size as usize
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}
