//! Per-process object heap and moving scavenger.

mod heap;

pub use heap::{CHUNK_SIZE, DEFAULT_MAX_CHUNKS, ObjectHeap, RootProvider};
