//! Object-graph snapshots.
//!
//! The graph codec drives the per-kind content codecs in the object
//! catalog. Shared structure and cycles are preserved through
//! back-references: every serialized heap object (except oddballs, which
//! are identified by class id) is numbered in discovery order.
//!
//! Reading allocates through a grow-only path: the heap ceiling is
//! raised instead of scavenging, so nothing moves while interior
//! pointers into half-built objects are live.

use std::collections::HashMap;

use object::{
    Array, ByteArray, Double, FALSE_CLASS_ID, Instance, LargeInteger, NULL_CLASS_ID,
    RAW_BYTE_TAG, SNAPSHOT_INTERNAL_SIZE_CUTOFF, SnapshotError, SnapshotReader, SnapshotWriter,
    Str, TRUE_CLASS_ID, TypeTag, Value, ValueReader, ValueWriter,
};

use crate::process::Process;

const TAG_SMI: u8 = 0;
const TAG_BACKREF: u8 = 1;
const TAG_ARRAY: u8 = 2;
const TAG_BYTE_ARRAY: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_LARGE_INTEGER: u8 = 6;
const TAG_INSTANCE: u8 = 7;
const TAG_ODDBALL: u8 = 8;

fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag(z: u64) -> i64 {
    ((z >> 1) as i64) ^ -((z & 1) as i64)
}

struct GraphWriter<'a> {
    table: &'a object::ClassTable,
    seen: HashMap<u64, u32>,
    next_index: u32,
}

impl GraphWriter<'_> {
    fn register(&mut self, value: Value) {
        self.seen.insert(value.raw(), self.next_index);
        self.next_index += 1;
    }
}

impl ValueWriter for GraphWriter<'_> {
    fn write_value(&mut self, writer: &mut SnapshotWriter, value: Value) {
        if let Some(n) = value.as_smi() {
            writer.write_byte(TAG_SMI);
            writer.write_cardinal(zigzag(n));
            return;
        }
        assert!(value.is_heap_object(), "marked values are never serialized");
        if let Some(&index) = self.seen.get(&value.raw()) {
            writer.write_byte(TAG_BACKREF);
            writer.write_cardinal(index as u64);
            return;
        }
        // SAFETY: heap values point at live objects; reinterpretation is
        // guarded by the class tag.
        unsafe {
            let header = value.as_obj::<object::HeapObject>().header;
            match header.tag() {
                TypeTag::Array => {
                    self.register(value);
                    let array = value.as_obj::<Array>();
                    writer.write_byte(TAG_ARRAY);
                    writer.write_cardinal(array.len() as u64);
                    array.write_content(writer, self);
                }
                TypeTag::ByteArray => {
                    self.register(value);
                    let bytes = value.as_obj::<ByteArray>();
                    if bytes.has_external_address() && bytes.external_tag() != RAW_BYTE_TAG {
                        panic!("can only serialize raw bytes");
                    }
                    writer.write_byte(TAG_BYTE_ARRAY);
                    writer.write_cardinal(bytes.len() as u64);
                    bytes.write_content(writer);
                }
                TypeTag::String => {
                    self.register(value);
                    let string = value.as_obj::<Str>();
                    writer.write_byte(TAG_STRING);
                    writer.write_cardinal(string.len() as u64);
                    string.write_content(writer);
                }
                TypeTag::Double => {
                    self.register(value);
                    writer.write_byte(TAG_DOUBLE);
                    value.as_obj::<Double>().write_content(writer);
                }
                TypeTag::LargeInteger => {
                    self.register(value);
                    writer.write_byte(TAG_LARGE_INTEGER);
                    value.as_obj::<LargeInteger>().write_content(writer);
                }
                TypeTag::Instance => {
                    self.register(value);
                    writer.write_byte(TAG_INSTANCE);
                    writer.write_cardinal(header.class_id() as u64);
                    let instance = value.as_obj::<Instance>();
                    let size = self.table.instance_size_for(header.class_id());
                    instance.write_content(size, writer, self);
                }
                TypeTag::Oddball => {
                    writer.write_byte(TAG_ODDBALL);
                    writer.write_cardinal(header.class_id() as u64);
                }
                TypeTag::Stack | TypeTag::Task => {
                    panic!("stacks and tasks are not serializable");
                }
            }
        }
    }
}

/// Serialize the graph reachable from `root`.
pub fn write_snapshot(process: &Process, root: Value) -> Vec<u8> {
    let mut writer = SnapshotWriter::new();
    let mut graph = GraphWriter {
        table: process.program.class_table(),
        seen: HashMap::new(),
        next_index: 0,
    };
    graph.write_value(&mut writer, root);
    writer.into_bytes()
}

struct GraphReader<'a> {
    process: &'a mut Process,
    objects: Vec<Value>,
}

impl GraphReader<'_> {
    /// Allocate without ever scavenging: raise the ceiling instead, so
    /// already-read objects stay put.
    fn alloc_or_grow(&mut self, alloc: impl Fn(&mut Process) -> Option<Value>) -> Value {
        loop {
            if let Some(value) = alloc(self.process) {
                return value;
            }
            self.process.heap.grow();
        }
    }
}

impl ValueReader for GraphReader<'_> {
    fn read_value(&mut self, reader: &mut SnapshotReader<'_>) -> Result<Value, SnapshotError> {
        match reader.read_byte()? {
            TAG_SMI => {
                let n = unzigzag(reader.read_cardinal()?);
                Value::try_from_i64(n).map_err(|_| SnapshotError::Malformed)
            }
            TAG_BACKREF => {
                let index = reader.read_cardinal()? as usize;
                self.objects.get(index).copied().ok_or(SnapshotError::Malformed)
            }
            TAG_ARRAY => {
                let length = reader.read_cardinal()? as usize;
                let filler = self.process.roots.null_object;
                let value = self.alloc_or_grow(|p| p.allocate_array(length, filler));
                self.objects.push(value);
                // SAFETY: freshly allocated array; the grow-only
                // allocation path keeps it in place during the reads.
                let array: &mut Array = unsafe { value.as_obj_mut() };
                array.read_content(reader, length, self)?;
                Ok(value)
            }
            TAG_BYTE_ARRAY => {
                let length = reader.read_cardinal()? as usize;
                if length > SNAPSHOT_INTERNAL_SIZE_CUTOFF {
                    let content = reader.read_external_bytes()?;
                    if content.len() != length {
                        return Err(SnapshotError::Malformed);
                    }
                    let buffer = content.to_vec().into_boxed_slice();
                    let value = self.alloc_or_grow(move |p| {
                        p.allocate_external_byte_array(buffer.clone())
                    });
                    self.objects.push(value);
                    Ok(value)
                } else {
                    let value = self.alloc_or_grow(|p| p.allocate_byte_array(length));
                    self.objects.push(value);
                    // SAFETY: freshly allocated byte array.
                    let bytes: &mut ByteArray = unsafe { value.as_obj_mut() };
                    bytes.read_content(reader, length)?;
                    Ok(value)
                }
            }
            TAG_STRING => {
                let length = reader.read_cardinal()? as usize;
                if length > SNAPSHOT_INTERNAL_SIZE_CUTOFF {
                    // External content travels with its trailing NUL.
                    let content = reader.read_external_bytes()?;
                    if content.len() != length + 1 || content[length] != 0 {
                        return Err(SnapshotError::Malformed);
                    }
                    if core::str::from_utf8(&content[..length]).is_err() {
                        return Err(SnapshotError::Malformed);
                    }
                    let buffer = content.to_vec().into_boxed_slice();
                    let value = self.alloc_or_grow(move |p| {
                        p.allocate_external_string(buffer.clone())
                    });
                    self.objects.push(value);
                    Ok(value)
                } else {
                    let placeholder = "\0".repeat(length);
                    let value = self.alloc_or_grow(|p| p.allocate_string(&placeholder));
                    self.objects.push(value);
                    // SAFETY: freshly allocated string of the right size.
                    let string: &mut Str = unsafe { value.as_obj_mut() };
                    string.read_content(reader, length)?;
                    Ok(value)
                }
            }
            TAG_DOUBLE => {
                let payload = reader.read_double()?;
                let value = self.alloc_or_grow(|p| p.allocate_double(payload));
                self.objects.push(value);
                Ok(value)
            }
            TAG_LARGE_INTEGER => {
                let payload = reader.read_int64()?;
                if Value::is_valid(payload) {
                    return Err(SnapshotError::Malformed);
                }
                let value = self.alloc_or_grow(|p| p.allocate_large_integer(payload));
                self.objects.push(value);
                Ok(value)
            }
            TAG_INSTANCE => {
                let class_id = reader.read_cardinal()? as usize;
                let table = self.process.program.class_table();
                if class_id >= table.len()
                    || table.tag_for(class_id as object::ClassId) != TypeTag::Instance
                {
                    return Err(SnapshotError::Malformed);
                }
                let class_id = class_id as object::ClassId;
                let instance_size = table.instance_size_for(class_id);
                let value = self.alloc_or_grow(|p| p.allocate_instance(class_id));
                self.objects.push(value);
                // SAFETY: freshly allocated instance.
                let instance: &mut Instance = unsafe { value.as_obj_mut() };
                instance.read_content(instance_size, reader, self)?;
                Ok(value)
            }
            TAG_ODDBALL => {
                let class_id = reader.read_cardinal()?;
                match class_id as object::ClassId {
                    NULL_CLASS_ID => Ok(self.process.roots.null_object),
                    TRUE_CLASS_ID => Ok(self.process.roots.true_object),
                    FALSE_CLASS_ID => Ok(self.process.roots.false_object),
                    _ => Err(SnapshotError::Malformed),
                }
            }
            _ => Err(SnapshotError::Malformed),
        }
    }
}

/// Rebuild a graph serialized by [`write_snapshot`] into the process's
/// heap and return its root.
pub fn read_snapshot(process: &mut Process, data: &[u8]) -> Result<Value, SnapshotError> {
    let mut reader = SnapshotReader::new(data);
    let mut graph = GraphReader { process, objects: Vec::new() };
    let root = graph.read_value(&mut reader)?;
    if !reader.is_at_end() {
        return Err(SnapshotError::Malformed);
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::tiny_program;
    use bytecode::{MethodKind, ProgramBuilder};
    use std::sync::Arc;

    fn round_trip(process: &mut Process, root: Value) -> Value {
        let bytes = write_snapshot(process, root);
        read_snapshot(process, &bytes).expect("snapshot read")
    }

    #[test]
    fn scalars_round_trip() {
        let mut process = Process::new(1, tiny_program());
        let restored = round_trip(&mut process, Value::from_smi(-42));
        assert_eq!(restored.as_smi(), Some(-42));

        let double = process.allocate_double(2.75).unwrap();
        let restored = round_trip(&mut process, double);
        assert_ne!(restored, double, "a fresh object is allocated");
        assert_eq!(unsafe { restored.as_obj::<Double>() }.value(), 2.75);

        let big = process.allocate_large_integer(object::MAX_SMI_VALUE + 7).unwrap();
        let restored = round_trip(&mut process, big);
        assert_eq!(
            unsafe { restored.as_obj::<LargeInteger>() }.value(),
            object::MAX_SMI_VALUE + 7
        );

        let true_object = process.roots.true_object;
        let restored = round_trip(&mut process, true_object);
        assert_eq!(restored, true_object, "oddballs read back as roots");
    }

    #[test]
    fn strings_round_trip_with_their_hash() {
        let mut process = Process::new(1, tiny_program());
        let original = process.allocate_string("snapshot me").unwrap();
        let original_hash = unsafe { original.as_obj::<Str>() }.hash_code();
        let restored = round_trip(&mut process, original);
        let restored_str: &Str = unsafe { restored.as_obj() };
        assert_eq!(restored_str.as_str(), "snapshot me");
        assert_eq!(restored_str.hash_code(), original_hash);
        assert!(restored_str.content_on_heap());
    }

    #[test]
    fn big_content_reads_back_external() {
        let mut process = Process::new(1, tiny_program());

        let text = "x".repeat(SNAPSHOT_INTERNAL_SIZE_CUTOFF + 10);
        let string = process.allocate_string(&text).unwrap();
        let restored = round_trip(&mut process, string);
        let restored_str: &Str = unsafe { restored.as_obj() };
        assert!(!restored_str.content_on_heap(), "big strings go external");
        assert_eq!(restored_str.as_str(), text);
        // The serialized form carries the trailing NUL: length + 1 bytes.
        assert_eq!(restored_str.bytes().len(), text.len());

        let bytes = process.allocate_byte_array(SNAPSHOT_INTERNAL_SIZE_CUTOFF + 5).unwrap();
        unsafe { bytes.as_obj_mut::<ByteArray>() }.bytes_mut().fill(0xEE);
        let restored = round_trip(&mut process, bytes);
        let restored_bytes: &ByteArray = unsafe { restored.as_obj() };
        assert!(restored_bytes.has_external_address());
        assert_eq!(restored_bytes.external_tag(), RAW_BYTE_TAG);
        assert!(restored_bytes.bytes().iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn sharing_and_cycles_are_preserved() {
        let mut process = Process::new(1, tiny_program());
        let shared = process.allocate_string("shared").unwrap();
        let array = process.allocate_array(3, process.roots.null_object).unwrap();
        {
            let array_ref: &mut Array = unsafe { array.as_obj_mut() };
            array_ref.at_put(0, shared);
            array_ref.at_put(1, array); // self reference
            array_ref.at_put(2, shared);
        }
        let restored = round_trip(&mut process, array);
        let restored_array: &Array = unsafe { restored.as_obj() };
        assert_eq!(restored_array.at(0), restored_array.at(2), "sharing survives");
        assert_eq!(restored_array.at(1), restored, "cycles survive");
        let s: &Str = unsafe { restored_array.at(0).as_obj() };
        assert_eq!(s.as_str(), "shared");
    }

    #[test]
    fn instances_round_trip_by_class_id() {
        let mut builder = ProgramBuilder::new();
        let point = builder.register_instance_class(2);
        let entry = builder.begin_method(MethodKind::Normal, 0, 4);
        builder.terminate_with_smi(0);
        builder.end_method();
        builder.set_entry(entry);
        let mut process = Process::new(1, Arc::new(builder.finish()));

        let instance = process.allocate_instance(point).unwrap();
        {
            let fields: &mut Instance = unsafe { instance.as_obj_mut() };
            fields.at_put(0, Value::from_smi(3));
            fields.at_put(1, process.roots.true_object);
        }
        let restored = round_trip(&mut process, instance);
        let fields: &Instance = unsafe { restored.as_obj() };
        assert_eq!(fields.at(0).as_smi(), Some(3));
        assert_eq!(fields.at(1), process.roots.true_object);
        let header = unsafe { restored.as_obj::<object::HeapObject>() }.header;
        assert_eq!(header.class_id(), point);
    }

    #[test]
    fn malformed_input_is_rejected() {
        let mut process = Process::new(1, tiny_program());
        assert_eq!(read_snapshot(&mut process, &[]), Err(SnapshotError::UnexpectedEof));
        assert_eq!(read_snapshot(&mut process, &[99]), Err(SnapshotError::Malformed));
        // A backref to an object that was never defined.
        assert_eq!(
            read_snapshot(&mut process, &[TAG_BACKREF, 0]),
            Err(SnapshotError::Malformed)
        );
        // Trailing garbage after the root.
        assert_eq!(
            read_snapshot(&mut process, &[TAG_SMI, 2, 0xFF]),
            Err(SnapshotError::Malformed)
        );
    }
}
