use crate::{ClassId, HeaderCell, Stack, TypeTag, Value, WORD_SIZE, align_up};

/// A fixed-shape object: `n` value slots, where `n` comes from the
/// program's class table.
///
/// ```text
/// [header 8B] [field_0 8B] [field_1 8B] ...
/// ```
///
/// Instances do not store their own size; [`Instance::length_from_size`]
/// recovers the field count from the class table's instance size.
#[repr(C)]
pub struct Instance {
    pub header: HeaderCell,
}

/// Write a fresh instance into `ptr` with every field set to `filler`.
///
/// # Safety
///
/// `ptr` must point at `instance_size` zeroed, word-aligned bytes;
/// `instance_size` must match the class table entry for `class_id`.
pub unsafe fn init_instance(
    ptr: *mut u8,
    tag: TypeTag,
    class_id: ClassId,
    instance_size: usize,
    filler: Value,
) -> Value {
    debug_assert!(matches!(
        tag,
        TypeTag::Instance | TypeTag::Task | TypeTag::Oddball
    ));
    // SAFETY: the caller hands us a large enough allocation.
    unsafe {
        let instance = &mut *(ptr as *mut Instance);
        instance.header = HeaderCell::new(tag, class_id);
        for index in 0..Instance::length_from_size(instance_size) {
            instance.at_put(index, filler);
        }
    }
    Value::from_ptr(ptr)
}

impl Instance {
    pub const fn allocation_size(field_count: usize) -> usize {
        align_up(size_of::<Instance>() + field_count * WORD_SIZE)
    }

    #[inline(always)]
    pub const fn length_from_size(instance_size: usize) -> usize {
        (instance_size - size_of::<Instance>()) / WORD_SIZE
    }

    #[inline(always)]
    fn fields_ptr(&self) -> *mut Value {
        (self as *const Instance).wrapping_add(1) as *mut Value
    }

    #[inline(always)]
    pub fn at(&self, index: usize) -> Value {
        // SAFETY: the class table bounds the caller's index.
        unsafe { *self.fields_ptr().add(index) }
    }

    #[inline(always)]
    pub fn at_put(&mut self, index: usize, value: Value) {
        debug_assert!(!value.is_marked(), "marked value stored into instance");
        // SAFETY: the class table bounds the caller's index.
        unsafe { *self.fields_ptr().add(index) = value }
    }

    /// Visit the address of every field. `instance_size` comes from the
    /// class table.
    pub fn roots_do(&mut self, instance_size: usize, cb: &mut dyn FnMut(&mut Value)) {
        let base = self.fields_ptr();
        for index in 0..Self::length_from_size(instance_size) {
            // SAFETY: index bounded by the class-table size.
            cb(unsafe { &mut *base.add(index) });
        }
    }
}

/// A task: an instance with a fixed slot layout.
#[repr(C)]
pub struct Task {
    instance: Instance,
}

impl Task {
    pub const STACK_INDEX: usize = 0;
    pub const ID_INDEX: usize = Self::STACK_INDEX + 1;
    pub const RESULT_INDEX: usize = Self::ID_INDEX + 1;
    pub const FIELD_COUNT: usize = Self::RESULT_INDEX + 1;

    #[inline(always)]
    pub fn header(&self) -> HeaderCell {
        self.instance.header
    }

    #[inline(always)]
    pub fn stack_value(&self) -> Value {
        self.instance.at(Self::STACK_INDEX)
    }

    /// # Safety
    ///
    /// The task must have an attached stack.
    #[inline(always)]
    pub unsafe fn stack(&self) -> &'static mut Stack {
        debug_assert!(self.has_stack());
        // SAFETY: slot checked to hold a stack by the caller.
        unsafe { self.stack_value().as_obj_mut() }
    }

    pub fn set_stack(&mut self, stack: Value) {
        debug_assert!(stack.is_heap_object());
        self.instance.at_put(Self::STACK_INDEX, stack);
    }

    /// Drop the stack reference; the stack becomes unreachable unless
    /// some other root still refers to it.
    pub fn detach_stack(&mut self) {
        self.instance.at_put(Self::STACK_INDEX, Value::zero());
    }

    pub fn has_stack(&self) -> bool {
        let value = self.stack_value();
        if !value.is_heap_object() {
            return false;
        }
        // SAFETY: heap values in a live process point at valid objects.
        let header: &HeaderCell = unsafe { value.as_obj() };
        header.tag() == TypeTag::Stack
    }

    pub fn id(&self) -> i64 {
        self.instance
            .at(Self::ID_INDEX)
            .as_smi()
            .expect("task id must be a smi")
    }

    pub fn set_id(&mut self, id: i64) {
        self.instance.at_put(Self::ID_INDEX, Value::from_smi(id));
    }

    pub fn result(&self) -> Value {
        self.instance.at(Self::RESULT_INDEX)
    }

    pub fn set_result(&mut self, value: Value) {
        self.instance.at_put(Self::RESULT_INDEX, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TASK_CLASS_ID, stack::tests::raw_stack};

    #[test]
    fn instance_field_round_trip() {
        let size = Instance::allocation_size(2);
        let mut backing = vec![0u64; size / WORD_SIZE];
        let v = unsafe {
            init_instance(
                backing.as_mut_ptr() as *mut u8,
                TypeTag::Instance,
                20,
                size,
                Value::zero(),
            )
        };
        let instance: &mut Instance = unsafe { v.as_obj_mut() };
        assert_eq!(Instance::length_from_size(size), 2);
        instance.at_put(1, Value::from_smi(11));
        assert_eq!(instance.at(1).as_smi(), Some(11));
        assert_eq!(instance.at(0).as_smi(), Some(0));
    }

    #[test]
    fn task_slots() {
        let size = Instance::allocation_size(Task::FIELD_COUNT);
        let mut backing = vec![0u64; size / WORD_SIZE];
        let v = unsafe {
            init_instance(
                backing.as_mut_ptr() as *mut u8,
                TypeTag::Task,
                TASK_CLASS_ID,
                size,
                Value::zero(),
            )
        };
        let task: &mut Task = unsafe { v.as_obj_mut() };
        task.set_id(4);
        assert_eq!(task.id(), 4);
        assert!(!task.has_stack(), "smi zero is not a stack");

        let (_backing, stack_value) = raw_stack(16);
        task.set_stack(stack_value);
        assert!(task.has_stack());

        task.detach_stack();
        assert!(!task.has_stack());
        assert_eq!(task.stack_value(), Value::zero());
    }
}
