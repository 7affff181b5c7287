use std::sync::Arc;

use bytecode::Program;
use heap::{ObjectHeap, RootProvider};
use object::{
    ARRAY_CLASS_ID, Array, BYTE_ARRAY_CLASS_ID, BYTE_ARRAY_COW_CLASS_ID,
    BYTE_ARRAY_SLICE_CLASS_ID, ByteArray, DOUBLE_CLASS_ID, Double, FALSE_CLASS_ID, Instance,
    LARGE_INTEGER_CLASS_ID, LargeInteger, NULL_CLASS_ID, RAW_BYTE_TAG, STACK_CLASS_ID,
    STRING_CLASS_ID, STRING_SLICE_CLASS_ID, Stack, Str, TASK_CLASS_ID, TRUE_CLASS_ID, Task,
    TypeTag, Value, init_array, init_byte_array, init_double, init_external_byte_array,
    init_instance, init_large_integer, init_stack, init_string,
};

/// Values the scavenger starts from. Everything a process can reach hangs
/// off these.
#[derive(Debug)]
pub struct ProcessRoots {
    pub null_object: Value,
    pub true_object: Value,
    pub false_object: Value,
    /// The task currently driven by the interpreter.
    pub current_task: Value,
    // Preallocated error strings, so throwing them never allocates.
    pub stack_overflow_error: Value,
    pub out_of_memory_error: Value,
    pub wrong_type_error: Value,
    pub out_of_bounds_error: Value,
    pub integer_overflow_error: Value,
}

struct ProcessRootsMut<'a> {
    roots: &'a mut ProcessRoots,
    scratch: &'a mut Vec<Value>,
}

impl RootProvider for ProcessRootsMut<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.roots.null_object);
        visitor(&mut self.roots.true_object);
        visitor(&mut self.roots.false_object);
        visitor(&mut self.roots.current_task);
        visitor(&mut self.roots.stack_overflow_error);
        visitor(&mut self.roots.out_of_memory_error);
        visitor(&mut self.roots.wrong_type_error);
        visitor(&mut self.roots.out_of_bounds_error);
        visitor(&mut self.roots.integer_overflow_error);
        for value in self.scratch.iter_mut() {
            visitor(value);
        }
    }
}

/// Outcome of mutable byte-content extraction.
#[derive(Debug)]
pub enum MutableBytes {
    /// The receiver is not byte-like, or slice bounds are bad.
    Refused,
    /// Materializing a copy-on-write backing ran out of memory; the
    /// caller should scavenge and retry.
    AllocationFailed,
    /// Writable content.
    Content { address: *mut u8, length: usize },
}

/// One unit of execution: a program, an object heap, and the roots that
/// keep the heap's live set. A process is driven by exactly one
/// interpreter at a time.
pub struct Process {
    pub id: u64,
    pub program: Arc<Program>,
    pub heap: ObjectHeap,
    pub roots: ProcessRoots,
    /// Temporary GC roots for primitives and codecs.
    pub scratch: Vec<Value>,
    next_task_id: i64,
}

impl Process {
    /// Boot a process: oddballs, error strings, and the initial task with
    /// a fresh stack. Boot allocations are small and must succeed.
    pub fn new(id: u64, program: Arc<Program>) -> Self {
        Self::with_heap(id, program, ObjectHeap::new())
    }

    pub fn with_heap(id: u64, program: Arc<Program>, heap: ObjectHeap) -> Self {
        let mut process = Self {
            id,
            program,
            heap,
            roots: ProcessRoots {
                null_object: Value::zero(),
                true_object: Value::zero(),
                false_object: Value::zero(),
                current_task: Value::zero(),
                stack_overflow_error: Value::zero(),
                out_of_memory_error: Value::zero(),
                wrong_type_error: Value::zero(),
                out_of_bounds_error: Value::zero(),
                integer_overflow_error: Value::zero(),
            },
            scratch: Vec::new(),
            next_task_id: 0,
        };
        let boot = |process: &mut Process, class_id| {
            process
                .allocate_oddball(class_id)
                .expect("boot allocation failed")
        };
        process.roots.null_object = boot(&mut process, NULL_CLASS_ID);
        process.roots.true_object = boot(&mut process, TRUE_CLASS_ID);
        process.roots.false_object = boot(&mut process, FALSE_CLASS_ID);
        let error = |process: &mut Process, text: &str| {
            process.allocate_string(text).expect("boot allocation failed")
        };
        process.roots.stack_overflow_error = error(&mut process, "STACK_OVERFLOW");
        process.roots.out_of_memory_error = error(&mut process, "OUT_OF_MEMORY");
        process.roots.wrong_type_error = error(&mut process, "WRONG_OBJECT_TYPE");
        process.roots.out_of_bounds_error = error(&mut process, "OUT_OF_BOUNDS");
        process.roots.integer_overflow_error = error(&mut process, "INTEGER_OVERFLOW");
        let task = process
            .allocate_task(object::STACK_INITIAL_LENGTH)
            .expect("boot allocation failed");
        process.roots.current_task = task;
        process
    }

    pub fn boolean(&self, value: bool) -> Value {
        if value { self.roots.true_object } else { self.roots.false_object }
    }

    pub fn is_true_value(&self, value: Value) -> bool {
        value != self.roots.false_object && value != self.roots.null_object
    }

    /// The task the interpreter drives. The root is established at boot
    /// and always holds a task.
    pub fn current_task(&self) -> &'static mut Task {
        // SAFETY: the root is established at boot and only replaced by
        // other task values.
        unsafe { self.roots.current_task.as_obj_mut() }
    }

    // ── Allocation ─────────────────────────────────────────────────

    fn allocate_oddball(&mut self, class_id: object::ClassId) -> Option<Value> {
        let size = self.program.class_table().instance_size_for(class_id);
        let ptr = self.heap.allocate(size)?;
        // Oddballs have no fields, so the filler is unused.
        Some(unsafe { init_instance(ptr, TypeTag::Oddball, class_id, size, Value::zero()) })
    }

    pub fn allocate_instance(&mut self, class_id: object::ClassId) -> Option<Value> {
        let table = self.program.class_table();
        let size = table.instance_size_for(class_id);
        let tag = table.tag_for(class_id);
        let filler = self.roots.null_object;
        let ptr = self.heap.allocate(size)?;
        // SAFETY: size freshly allocated and matches the class table.
        Some(unsafe { init_instance(ptr, tag, class_id, size, filler) })
    }

    pub fn allocate_array(&mut self, length: usize, filler: Value) -> Option<Value> {
        let ptr = self.heap.allocate(Array::allocation_size(length))?;
        // SAFETY: size freshly allocated.
        Some(unsafe { init_array(ptr, ARRAY_CLASS_ID, length, filler) })
    }

    pub fn allocate_byte_array(&mut self, length: usize) -> Option<Value> {
        let ptr = self.heap.allocate(ByteArray::internal_allocation_size(length))?;
        // SAFETY: size freshly allocated.
        Some(unsafe { init_byte_array(ptr, BYTE_ARRAY_CLASS_ID, length) })
    }

    /// Wrap an off-heap buffer. The heap takes ownership and registers
    /// the external allocation.
    pub fn allocate_external_byte_array(&mut self, buffer: Box<[u8]>) -> Option<Value> {
        let length = buffer.len();
        let ptr = self.heap.allocate(ByteArray::external_allocation_size())?;
        let address = Box::into_raw(buffer) as *mut u8;
        self.heap.register_external_allocation(length);
        // SAFETY: size freshly allocated; the buffer is leaked into the
        // byte array's ownership.
        Some(unsafe {
            init_external_byte_array(ptr, BYTE_ARRAY_CLASS_ID, length, address, RAW_BYTE_TAG)
        })
    }

    /// Detach an external buffer and return it to the caller; the
    /// external allocation is unregistered from the process.
    pub fn neuter_byte_array(&mut self, value: Value) -> Box<[u8]> {
        // SAFETY: the caller hands us a byte array value.
        let bytes: &mut ByteArray = unsafe { value.as_obj_mut() };
        let (address, length) = bytes.neuter();
        self.heap.unregister_external_allocation(length);
        // SAFETY: the buffer was leaked by allocate_external_byte_array.
        unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(address, length)) }
    }

    pub fn allocate_string(&mut self, content: &str) -> Option<Value> {
        let ptr = self.heap.allocate(Str::internal_allocation_size(content.len()))?;
        // SAFETY: size freshly allocated; &str is valid UTF-8.
        Some(unsafe { init_string(ptr, STRING_CLASS_ID, content.as_bytes()) })
    }

    /// Wrap an off-heap string buffer holding the UTF-8 content plus the
    /// trailing NUL. The buffer is owned by the string for the life of
    /// the process.
    pub fn allocate_external_string(&mut self, buffer: Box<[u8]>) -> Option<Value> {
        assert!(!buffer.is_empty() && buffer[buffer.len() - 1] == 0);
        let length = buffer.len() - 1;
        debug_assert!(core::str::from_utf8(&buffer[..length]).is_ok());
        let ptr = self.heap.allocate(Str::external_allocation_size())?;
        let address = Box::leak(buffer).as_ptr();
        // SAFETY: size freshly allocated; the buffer was just leaked.
        Some(unsafe { object::init_external_string(ptr, STRING_CLASS_ID, length, address) })
    }

    pub fn allocate_double(&mut self, value: f64) -> Option<Value> {
        let ptr = self.heap.allocate(Double::allocation_size())?;
        // SAFETY: size freshly allocated.
        Some(unsafe { init_double(ptr, DOUBLE_CLASS_ID, value) })
    }

    pub fn allocate_large_integer(&mut self, value: i64) -> Option<Value> {
        debug_assert!(!Value::is_valid(value));
        let ptr = self.heap.allocate(LargeInteger::allocation_size())?;
        // SAFETY: size freshly allocated; range asserted.
        Some(unsafe { init_large_integer(ptr, LARGE_INTEGER_CLASS_ID, value) })
    }

    /// A smi when it fits, a large integer otherwise.
    pub fn allocate_integer(&mut self, value: i64) -> Option<Value> {
        match Value::try_from_i64(value) {
            Ok(smi) => Some(smi),
            Err(_) => self.allocate_large_integer(value),
        }
    }

    pub fn allocate_stack(&mut self, length: usize) -> Option<Value> {
        let ptr = self.heap.allocate(Stack::allocation_size(length))?;
        // SAFETY: size freshly allocated.
        Some(unsafe { init_stack(ptr, STACK_CLASS_ID, length) })
    }

    /// A task plus its initial stack, linked both ways.
    pub fn allocate_task(&mut self, stack_length: usize) -> Option<Value> {
        let task_value = self.allocate_instance(TASK_CLASS_ID)?;
        // Root the task while the stack allocation can scavenge-fail.
        self.scratch.push(task_value);
        let stack_value = self.allocate_stack(stack_length);
        let task_value = self.scratch.pop().expect("scratch underflow");
        let stack_value = stack_value?;
        // SAFETY: freshly allocated task and stack values.
        unsafe {
            let task: &mut Task = task_value.as_obj_mut();
            task.set_stack(stack_value);
            task.set_id(self.next_task_id);
            task.set_result(self.roots.null_object);
            let stack: &mut Stack = stack_value.as_obj_mut();
            stack.set_task(task_value);
        }
        self.next_task_id += 1;
        Some(task_value)
    }

    pub fn allocate_cow_byte_array(&mut self, backing: Value, mutable: bool) -> Option<Value> {
        self.scratch.push(backing);
        let cow = self.allocate_instance(BYTE_ARRAY_COW_CLASS_ID);
        let backing = self.scratch.pop().expect("scratch underflow");
        let cow = cow?;
        // SAFETY: freshly allocated instance of the COW class.
        let instance: &mut Instance = unsafe { cow.as_obj_mut() };
        instance.at_put(0, backing);
        instance.at_put(1, self.boolean(mutable));
        Some(cow)
    }

    pub fn allocate_byte_array_slice(&mut self, backing: Value, from: i64, to: i64) -> Option<Value> {
        self.allocate_slice(BYTE_ARRAY_SLICE_CLASS_ID, backing, from, to)
    }

    pub fn allocate_string_slice(&mut self, backing: Value, from: i64, to: i64) -> Option<Value> {
        self.allocate_slice(STRING_SLICE_CLASS_ID, backing, from, to)
    }

    fn allocate_slice(
        &mut self,
        class_id: object::ClassId,
        backing: Value,
        from: i64,
        to: i64,
    ) -> Option<Value> {
        self.scratch.push(backing);
        let slice = self.allocate_instance(class_id);
        let backing = self.scratch.pop().expect("scratch underflow");
        let slice = slice?;
        // SAFETY: freshly allocated slice instance.
        let instance: &mut Instance = unsafe { slice.as_obj_mut() };
        instance.at_put(0, backing);
        instance.at_put(1, Value::from_smi(from));
        instance.at_put(2, Value::from_smi(to));
        Some(slice)
    }

    // ── Collection ─────────────────────────────────────────────────

    /// Run a scavenge over this process's heap. Any stack driven by an
    /// interpreter must have been stored back first.
    pub fn collect(&mut self) {
        let bounds = self.program.code_bounds();
        let mut roots = ProcessRootsMut { roots: &mut self.roots, scratch: &mut self.scratch };
        self.heap.scavenge(self.program.class_table(), &bounds, &mut roots);
    }

    // ── Byte content ───────────────────────────────────────────────

    /// Mutable byte content of byte arrays, COW byte arrays, and byte
    /// array slices. The first write to a copy-on-write byte array
    /// materializes a private backing; if that allocation fails the
    /// caller is expected to scavenge and retry.
    pub fn mutable_byte_content(&mut self, value: Value) -> MutableBytes {
        if !value.is_heap_object() {
            return MutableBytes::Refused;
        }
        // SAFETY: heap values point at live objects.
        unsafe {
            match object::class_tag(value) {
                TypeTag::ByteArray => {
                    let bytes: &mut ByteArray = value.as_obj_mut();
                    if bytes.has_external_address() && bytes.external_tag() != RAW_BYTE_TAG {
                        return MutableBytes::Refused;
                    }
                    let content = bytes.bytes_mut();
                    MutableBytes::Content {
                        address: content.as_mut_ptr(),
                        length: content.len(),
                    }
                }
                TypeTag::Instance => self.mutable_instance_content(value),
                _ => MutableBytes::Refused,
            }
        }
    }

    /// # Safety
    ///
    /// `value` must be a live instance.
    unsafe fn mutable_instance_content(&mut self, value: Value) -> MutableBytes {
        // SAFETY: per-class reinterpretation guarded by the class id.
        unsafe {
            let class_id = value.as_obj::<object::HeapObject>().header.class_id();
            if class_id == BYTE_ARRAY_COW_CLASS_ID {
                let instance: &mut Instance = value.as_obj_mut();
                let backing = instance.at(0);
                if instance.at(1) == self.roots.true_object {
                    return self.mutable_byte_content(backing);
                }
                debug_assert!(instance.at(1) == self.roots.false_object);
                let table = self.program.class_table();
                let Some(content) =
                    object::byte_content(backing, table, object::BlobKind::StringsOrByteArrays)
                else {
                    return MutableBytes::Refused;
                };
                let (content_ptr, content_len) = (content.as_ptr(), content.len());
                self.scratch.push(value);
                let fresh = self.allocate_byte_array(content_len);
                let value = self.scratch.pop().expect("scratch underflow");
                let Some(fresh) = fresh else {
                    // The materialization should have worked; report the
                    // failure so the caller retries after a scavenge.
                    return MutableBytes::AllocationFailed;
                };
                // Re-derive the instance: the allocation cannot have
                // moved it (no scavenge ran), but the borrow did lapse.
                let instance: &mut Instance = value.as_obj_mut();
                let fresh_bytes: &mut ByteArray = fresh.as_obj_mut();
                fresh_bytes
                    .bytes_mut()
                    .copy_from_slice(core::slice::from_raw_parts(content_ptr, content_len));
                instance.at_put(0, fresh);
                instance.at_put(1, self.roots.true_object);
                self.mutable_byte_content(fresh)
            } else if class_id == BYTE_ARRAY_SLICE_CLASS_ID {
                let instance: &Instance = value.as_obj();
                let wrapped = instance.at(0);
                let (Some(from), Some(to)) = (instance.at(1).as_smi(), instance.at(2).as_smi())
                else {
                    return MutableBytes::Refused;
                };
                if !wrapped.is_heap_object() {
                    return MutableBytes::Refused;
                }
                match self.mutable_byte_content(wrapped) {
                    MutableBytes::Content { address, length } => {
                        if 0 <= from && from <= to && to as usize <= length {
                            MutableBytes::Content {
                                address: address.add(from as usize),
                                length: (to - from) as usize,
                            }
                        } else {
                            MutableBytes::Refused
                        }
                    }
                    other => other,
                }
            } else {
                MutableBytes::Refused
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytecode::{MethodKind, ProgramBuilder};

    pub(crate) fn tiny_program() -> Arc<Program> {
        let mut builder = ProgramBuilder::new();
        let entry = builder.begin_method(MethodKind::Normal, 0, 4);
        builder.terminate_with_smi(0);
        builder.end_method();
        builder.set_entry(entry);
        Arc::new(builder.finish())
    }

    #[test]
    fn boot_establishes_roots_and_task() {
        let process = Process::new(1, tiny_program());
        assert!(process.roots.null_object.is_heap_object());
        assert_ne!(process.roots.true_object, process.roots.false_object);
        let task = process.current_task();
        assert!(task.has_stack());
        assert_eq!(task.id(), 0);
        assert!(process.is_true_value(process.roots.true_object));
        assert!(!process.is_true_value(process.roots.false_object));
        assert!(!process.is_true_value(process.roots.null_object));
        assert!(process.is_true_value(Value::from_smi(0)), "smis are truthy");
    }

    #[test]
    fn collect_keeps_roots_alive_and_moves_them() {
        let mut process = Process::new(1, tiny_program());
        let before = process.roots.current_task;
        let garbage = process.allocate_string("soon unreachable").unwrap();
        let _ = garbage;
        process.collect();
        let after = process.roots.current_task;
        assert_ne!(before, after, "scavenge relocates the task");
        let task: &Task = unsafe { after.as_obj() };
        assert!(task.has_stack());
    }

    #[test]
    fn integer_allocation_picks_representation() {
        let mut process = Process::new(1, tiny_program());
        let small = process.allocate_integer(42).unwrap();
        assert_eq!(small.as_smi(), Some(42));
        let big = process.allocate_integer(object::MAX_SMI_VALUE + 1).unwrap();
        assert!(unsafe { object::is_large_integer(big) });
        let large: &LargeInteger = unsafe { big.as_obj() };
        assert_eq!(large.value(), object::MAX_SMI_VALUE + 1);
    }

    #[test]
    fn external_byte_array_lifecycle() {
        let mut process = Process::new(1, tiny_program());
        let buffer = vec![7u8; 32].into_boxed_slice();
        let value = process.allocate_external_byte_array(buffer).unwrap();
        assert_eq!(process.heap.external_bytes(), 32);
        let recovered = process.neuter_byte_array(value);
        assert_eq!(process.heap.external_bytes(), 0);
        assert_eq!(recovered.len(), 32);
        assert!(recovered.iter().all(|&b| b == 7));
    }

    #[test]
    fn cow_first_write_materializes_once() {
        let mut process = Process::new(1, tiny_program());
        let backing = process.allocate_byte_array(4).unwrap();
        unsafe { backing.as_obj_mut::<ByteArray>() }.bytes_mut().copy_from_slice(&[1, 2, 3, 4]);
        let cow = process.allocate_cow_byte_array(backing, false).unwrap();

        let MutableBytes::Content { address, length } = process.mutable_byte_content(cow) else {
            panic!("expected content");
        };
        assert_eq!(length, 4);
        // SAFETY: content handed out by the extractor.
        unsafe { *address = 9 };

        let instance: &Instance = unsafe { cow.as_obj() };
        let materialized = instance.at(0);
        assert_ne!(materialized, backing, "backing is unique after the write");
        assert_eq!(instance.at(1), process.roots.true_object);
        let original: &ByteArray = unsafe { backing.as_obj() };
        assert_eq!(original.bytes(), &[1, 2, 3, 4], "original is untouched");
        let fresh: &ByteArray = unsafe { materialized.as_obj() };
        assert_eq!(fresh.bytes(), &[9, 2, 3, 4]);

        // A second extraction does not re-materialize.
        let _ = process.mutable_byte_content(cow);
        let instance: &Instance = unsafe { cow.as_obj() };
        assert_eq!(instance.at(0), materialized);
    }

    #[test]
    fn cow_materialization_survives_heap_exhaustion() {
        let mut process =
            Process::with_heap(1, tiny_program(), ObjectHeap::with_max_chunks(1));
        let backing = process.allocate_byte_array(64).unwrap();
        let cow = process.allocate_cow_byte_array(backing, false).unwrap();
        let slice = process.allocate_byte_array_slice(cow, 8, 16).unwrap();

        // Exhaust the heap with garbage, down to less than one object.
        while process.allocate_byte_array(1024).is_some() {}
        while process.allocate_byte_array(0).is_some() {}

        match process.mutable_byte_content(slice) {
            MutableBytes::AllocationFailed => {}
            other => panic!("expected AllocationFailed, got {other:?}"),
        }

        // The caller's contract: scavenge, then retry.
        process.scratch.push(slice);
        process.collect();
        let slice = process.scratch.pop().unwrap();
        match process.mutable_byte_content(slice) {
            MutableBytes::Content { length, .. } => assert_eq!(length, 8),
            other => panic!("expected content after scavenge, got {other:?}"),
        }
        // SAFETY: the slice instance survived the scavenge.
        let instance: &Instance = unsafe { slice.as_obj() };
        let cow: &Instance = unsafe { instance.at(0).as_obj() };
        assert_eq!(cow.at(1), process.roots.true_object, "mutable flag set");
    }

    #[test]
    fn slice_bounds_are_validated() {
        let mut process = Process::new(1, tiny_program());
        let backing = process.allocate_byte_array(8).unwrap();
        let slice = process.allocate_byte_array_slice(backing, 6, 12).unwrap();
        assert!(matches!(process.mutable_byte_content(slice), MutableBytes::Refused));
    }
}
