//! Kernel implementations behind the [`TensorOp`](crate::loom::ops::TensorOp) boundary,
//! and the shape-checked tensor frontend that emits them.

pub mod cpu;
pub mod frontend;
pub mod gpu;
