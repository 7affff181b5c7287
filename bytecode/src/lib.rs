//! The executable side of a program: opcodes, method headers, the
//! bytecode region, and the builder that assembles them.

mod builder;
mod instruction;
mod method;
mod op;
mod program;

pub use builder::{Label, ProgramBuilder};
pub use instruction::{Instruction, decode};
pub use method::{
    METHOD_HEADER_SIZE, MAX_SCALED_HEIGHT, Method, MethodKind, encode_header,
};
pub use op::Op;
pub use program::{FRAME_MARKER_OFFSET, Program};
