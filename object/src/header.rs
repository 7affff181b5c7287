use crate::Value;

/// Object kind stored in the low bits of every heap object header.
///
/// The numbering is wire-visible: snapshot records store these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Array = 0,
    String = 1,
    Instance = 2,
    Oddball = 3,
    Double = 4,
    ByteArray = 5,
    LargeInteger = 6,
    Stack = 7,
    Task = 8,
}

impl TypeTag {
    pub const COUNT: usize = TypeTag::Task as usize + 1;
}

impl TryFrom<u8> for TypeTag {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: TypeTag is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, TypeTag>(byte) })
        } else {
            Err(byte)
        }
    }
}

pub const CLASS_TAG_BIT_SIZE: u32 = 4;
pub const CLASS_TAG_MASK: u64 = (1 << CLASS_TAG_BIT_SIZE) - 1;
pub const CLASS_ID_BIT_SIZE: u32 = 10;
pub const CLASS_ID_MASK: u64 = (1 << CLASS_ID_BIT_SIZE) - 1;

/// A program-wide class index.
pub type ClassId = u16;

/// The first word of every heap object.
///
/// Outside a scavenge it holds a smi packing the class id and the class
/// tag:
///
/// ```text
/// [class_id:10][class_tag:4] << smi tag
/// ```
///
/// During a scavenge it may instead hold a heap-tagged forwarding pointer
/// to the relocated copy. [`HeaderCell::decode`] returns the sum;
/// [`HeaderCell::header`] asserts the class-header case and is the accessor
/// for all non-GC code.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct HeaderCell(Value);

/// Decoded class header: the kind tag plus the class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: TypeTag,
    pub class_id: ClassId,
}

/// What a header cell currently holds.
#[derive(Debug, Clone, Copy)]
pub enum HeaderWord {
    Class(Header),
    Forward(u64),
}

impl Header {
    #[inline(always)]
    pub fn new(tag: TypeTag, class_id: ClassId) -> Self {
        debug_assert!((class_id as u64) <= CLASS_ID_MASK);
        Self { tag, class_id }
    }

    #[inline(always)]
    fn encode(self) -> Value {
        let word = ((self.class_id as i64) << CLASS_TAG_BIT_SIZE) | self.tag as i64;
        Value::from_smi(word)
    }

    #[inline(always)]
    fn decode(word: Value) -> Self {
        // SAFETY: the caller established that the cell holds a smi.
        let word = unsafe { word.to_smi() } as u64;
        let raw_tag = (word & CLASS_TAG_MASK) as u8;
        let tag = TypeTag::try_from(raw_tag).expect("bad class tag");
        let class_id = ((word >> CLASS_TAG_BIT_SIZE) & CLASS_ID_MASK) as ClassId;
        Self { tag, class_id }
    }
}

impl HeaderCell {
    #[inline(always)]
    pub fn new(tag: TypeTag, class_id: ClassId) -> Self {
        Self(Header::new(tag, class_id).encode())
    }

    /// The class header. Must not be called while the cell holds a
    /// forwarding pointer.
    #[inline(always)]
    pub fn header(self) -> Header {
        assert!(self.0.is_smi(), "header cell holds a forwarding pointer");
        Header::decode(self.0)
    }

    /// The header cell as seen by the scavenger: either the class header
    /// or a forwarding pointer.
    #[inline(always)]
    pub fn decode(self) -> HeaderWord {
        if self.0.is_smi() {
            HeaderWord::Class(Header::decode(self.0))
        } else {
            debug_assert!(self.0.is_heap_object());
            HeaderWord::Forward(self.0.addr())
        }
    }

    /// Overwrite the cell with a forwarding pointer to `addr`.
    #[inline(always)]
    pub fn forward_to(&mut self, addr: u64) {
        debug_assert!(self.0.is_smi(), "object forwarded twice");
        self.0 = Value::from_addr(addr);
    }

    #[inline(always)]
    pub fn tag(self) -> TypeTag {
        self.header().tag
    }

    #[inline(always)]
    pub fn class_id(self) -> ClassId {
        self.header().class_id
    }

    #[inline(always)]
    pub fn raw(self) -> Value {
        self.0
    }

    #[inline(always)]
    pub fn from_raw(value: Value) -> Self {
        Self(value)
    }
}

impl core::fmt::Debug for HeaderCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.decode() {
            HeaderWord::Class(h) => {
                write!(f, "Header({:?}, class {})", h.tag, h.class_id)
            }
            HeaderWord::Forward(addr) => write!(f, "Forward(0x{addr:x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        for (i, tag) in [
            TypeTag::Array,
            TypeTag::String,
            TypeTag::Instance,
            TypeTag::Oddball,
            TypeTag::Double,
            TypeTag::ByteArray,
            TypeTag::LargeInteger,
            TypeTag::Stack,
            TypeTag::Task,
        ]
        .into_iter()
        .enumerate()
        {
            let cell = HeaderCell::new(tag, 37);
            assert_eq!(cell.tag(), tag, "tag mismatch at index {i}");
            assert_eq!(cell.class_id(), 37);
            assert!(cell.raw().is_smi(), "class header must be a smi");
        }
    }

    #[test]
    fn class_id_limits() {
        let cell = HeaderCell::new(TypeTag::Instance, CLASS_ID_MASK as ClassId);
        assert_eq!(cell.class_id(), CLASS_ID_MASK as ClassId);
    }

    #[test]
    fn forwarding_replaces_class_header() {
        let mut cell = HeaderCell::new(TypeTag::Array, 3);
        let target: u64 = 0x1000;
        cell.forward_to(target);
        match cell.decode() {
            HeaderWord::Forward(addr) => assert_eq!(addr, target),
            HeaderWord::Class(_) => panic!("expected forwarding pointer"),
        }
    }

    #[test]
    #[should_panic(expected = "forwarding pointer")]
    fn header_asserts_on_forwarded_cell() {
        let mut cell = HeaderCell::new(TypeTag::Array, 3);
        cell.forward_to(0x1000);
        let _ = cell.header();
    }
}
