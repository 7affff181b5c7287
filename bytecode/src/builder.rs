use object::{ClassId, ClassTable};

use crate::{MethodKind, Op, Program, encode_header};

/// A branch or link target. Created unbound, bound once, and resolved
/// into every instruction that referenced it.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

#[derive(Debug)]
struct LabelState {
    position: Option<usize>,
    patches: Vec<Patch>,
}

#[derive(Debug, Clone, Copy)]
enum Patch {
    /// 16-bit offset relative to the end of the instruction.
    Rel16 { operand_pos: usize, from: usize },
    /// 32-bit absolute bytecode offset.
    Abs32 { operand_pos: usize },
}

/// Assembles methods, labels, and the class table into a [`Program`].
///
/// Offset 0 of the bytecode region is reserved for the frame marker;
/// method headers start after it.
pub struct ProgramBuilder {
    code: Vec<u8>,
    classes: ClassTable,
    entry: Option<u32>,
    labels: Vec<LabelState>,
    unbound: usize,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            code: vec![0], // reserved frame-marker byte
            classes: ClassTable::with_builtins(),
            entry: None,
            labels: Vec::new(),
            unbound: 0,
        }
    }

    pub fn register_instance_class(&mut self, field_count: u32) -> ClassId {
        self.classes.register_instance_class(field_count)
    }

    // ── Methods ────────────────────────────────────────────────────

    /// Start a method; returns the header offset used as a call target.
    pub fn begin_method(&mut self, kind: MethodKind, arity: u8, max_height: usize) -> u32 {
        let offset = self.code.len() as u32;
        encode_header(&mut self.code, kind, arity, max_height, 0);
        offset
    }

    pub fn end_method(&mut self) {}

    // ── Labels ─────────────────────────────────────────────────────

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState { position: None, patches: Vec::new() });
        self.unbound += 1;
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position and resolve every pending
    /// reference.
    pub fn bind(&mut self, label: Label) {
        let position = self.code.len();
        let state = &mut self.labels[label.0];
        assert!(state.position.is_none(), "label bound twice");
        state.position = Some(position);
        self.unbound -= 1;
        let patches = core::mem::take(&mut state.patches);
        for patch in patches {
            self.resolve(patch, position);
        }
    }

    fn resolve(&mut self, patch: Patch, position: usize) {
        match patch {
            Patch::Rel16 { operand_pos, from } => {
                let delta = position as i64 - from as i64;
                let delta = i16::try_from(delta).expect("branch offset out of range");
                self.code[operand_pos..operand_pos + 2].copy_from_slice(&delta.to_le_bytes());
            }
            Patch::Abs32 { operand_pos } => {
                let target = u32::try_from(position).expect("bytecode region too large");
                self.code[operand_pos..operand_pos + 4].copy_from_slice(&target.to_le_bytes());
            }
        }
    }

    fn reference(&mut self, label: Label, patch: Patch) {
        match self.labels[label.0].position {
            Some(position) => self.resolve(patch, position),
            None => self.labels[label.0].patches.push(patch),
        }
    }

    // ── Emitters ───────────────────────────────────────────────────

    fn op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    pub fn load_smi(&mut self, value: i32) {
        self.op(Op::LoadSmi);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn load_null(&mut self) {
        self.op(Op::LoadNull);
    }

    pub fn load_true(&mut self) {
        self.op(Op::LoadTrue);
    }

    pub fn load_false(&mut self) {
        self.op(Op::LoadFalse);
    }

    pub fn load_local(&mut self, slot: u8) {
        self.op(Op::LoadLocal);
        self.code.push(slot);
    }

    pub fn store_local(&mut self, slot: u8) {
        self.op(Op::StoreLocal);
        self.code.push(slot);
    }

    pub fn pop(&mut self, count: u8) {
        self.op(Op::Pop);
        self.code.push(count);
    }

    pub fn dup(&mut self) {
        self.op(Op::Dup);
    }

    pub fn call_static(&mut self, target: u32) {
        self.op(Op::CallStatic);
        self.code.extend_from_slice(&target.to_le_bytes());
    }

    pub fn ret(&mut self, locals: u8, arity: u8) {
        self.op(Op::Return);
        self.code.push(locals);
        self.code.push(arity);
    }

    fn branch_op(&mut self, op: Op, label: Label) {
        self.op(op);
        let operand_pos = self.code.len();
        self.code.extend_from_slice(&[0, 0]);
        let from = self.code.len();
        self.reference(label, Patch::Rel16 { operand_pos, from });
    }

    pub fn branch(&mut self, label: Label) {
        self.branch_op(Op::Branch, label);
    }

    pub fn branch_if_true(&mut self, label: Label) {
        self.branch_op(Op::BranchIfTrue, label);
    }

    pub fn branch_if_false(&mut self, label: Label) {
        self.branch_op(Op::BranchIfFalse, label);
    }

    pub fn add(&mut self) {
        self.op(Op::Add);
    }

    pub fn sub(&mut self) {
        self.op(Op::Sub);
    }

    pub fn compare_to(&mut self) {
        self.op(Op::CompareTo);
    }

    pub fn eq(&mut self) {
        self.op(Op::Eq);
    }

    pub fn at(&mut self) {
        self.op(Op::At);
    }

    pub fn at_put(&mut self) {
        self.op(Op::AtPut);
    }

    pub fn link(&mut self, catch_target: Label) {
        self.op(Op::Link);
        let operand_pos = self.code.len();
        self.code.extend_from_slice(&[0, 0, 0, 0]);
        self.reference(catch_target, Patch::Abs32 { operand_pos });
    }

    pub fn unlink(&mut self) {
        self.op(Op::Unlink);
    }

    pub fn throw(&mut self) {
        self.op(Op::Throw);
    }

    pub fn push_block(&mut self, slot: u8) {
        self.op(Op::PushBlock);
        self.code.push(slot);
    }

    pub fn primitive(&mut self, index: u16) {
        self.op(Op::Primitive);
        self.code.extend_from_slice(&index.to_le_bytes());
    }

    pub fn yield_(&mut self) {
        self.op(Op::Yield);
    }

    pub fn terminate(&mut self) {
        self.op(Op::Terminate);
    }

    pub fn terminate_with_smi(&mut self, value: i32) {
        self.load_smi(value);
        self.terminate();
    }

    // ── Finishing ──────────────────────────────────────────────────

    pub fn set_entry(&mut self, method_offset: u32) {
        self.entry = Some(method_offset);
    }

    pub fn finish(self) -> Program {
        assert_eq!(self.unbound, 0, "unbound labels");
        let entry = self.entry.expect("entry method not set");
        Program::new(self.code, self.classes, entry)
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Instruction, decode, METHOD_HEADER_SIZE};

    #[test]
    fn forward_branch_is_patched() {
        let mut builder = ProgramBuilder::new();
        let entry = builder.begin_method(MethodKind::Normal, 0, 4);
        let done = builder.new_label();
        builder.load_true();
        builder.branch_if_true(done);
        builder.load_smi(1);
        builder.bind(done);
        builder.terminate_with_smi(0);
        builder.end_method();
        builder.set_entry(entry);
        let program = builder.finish();

        let code = program.bytecodes();
        let body = entry as usize + METHOD_HEADER_SIZE;
        let (i1, pc) = decode(code, body);
        assert_eq!(i1, Instruction::LoadTrue);
        let (i2, pc) = decode(code, pc);
        // The branch skips the LoadSmi (5 bytes).
        assert_eq!(i2, Instruction::BranchIfTrue { offset: 5 });
        let (i3, _) = decode(code, pc);
        assert_eq!(i3, Instruction::LoadSmi { value: 1 });
    }

    #[test]
    fn backward_branch_has_negative_offset() {
        let mut builder = ProgramBuilder::new();
        let entry = builder.begin_method(MethodKind::Normal, 0, 4);
        let top = builder.new_label();
        builder.bind(top);
        builder.load_true();
        builder.branch_if_true(top);
        builder.terminate_with_smi(0);
        builder.end_method();
        builder.set_entry(entry);
        let program = builder.finish();

        let code = program.bytecodes();
        let body = entry as usize + METHOD_HEADER_SIZE;
        let (_, pc) = decode(code, body);
        let (branch, _) = decode(code, pc);
        assert_eq!(branch, Instruction::BranchIfTrue { offset: -4 });
    }

    #[test]
    fn link_targets_are_absolute() {
        let mut builder = ProgramBuilder::new();
        let entry = builder.begin_method(MethodKind::Normal, 0, 8);
        let catch = builder.new_label();
        builder.link(catch);
        builder.unlink();
        builder.terminate_with_smi(0);
        builder.bind(catch);
        builder.terminate_with_smi(1);
        builder.end_method();
        builder.set_entry(entry);
        let program = builder.finish();

        let code = program.bytecodes();
        let body = entry as usize + METHOD_HEADER_SIZE;
        let (link, _) = decode(code, body);
        let Instruction::Link { target } = link else { panic!("expected link") };
        let (at_target, _) = decode(code, target as usize);
        assert_eq!(at_target, Instruction::LoadSmi { value: 1 });
    }

    #[test]
    #[should_panic(expected = "unbound labels")]
    fn unbound_label_is_rejected() {
        let mut builder = ProgramBuilder::new();
        let entry = builder.begin_method(MethodKind::Normal, 0, 4);
        let never = builder.new_label();
        builder.branch(never);
        builder.set_entry(entry);
        let _ = builder.finish();
    }
}
