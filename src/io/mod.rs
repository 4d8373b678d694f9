//! I/O utilities shared by the direct and tunneled relay paths

mod copy;

pub use copy::{copy_bidirectional, is_normal_close, CopyOutcome};
