//! A stream-synchronized dataflow engine for neural network graphs.
//!
//! Tensors live on a [`Backend`](loom::device::Backend) (host or `wgpu`) and every
//! operation is enqueued on an explicit execution [`Context`](loom::context::Context).
//! Values that flow between blocks are wrapped in [`Connector`](loom::connector::Connector)s,
//! which order readers after the producer and sum gradients from every reader.

pub mod blocks;
pub mod config;
pub mod error;
pub mod hal;
pub mod loom;

pub use error::{Error, Result};
pub use loom::{
    connector::{Connector, GraphProtocolError, Usage},
    context::{Context, Event},
    device::{Backend, Cpu, DeviceError, Gpu},
    tensor::{Shape, ShapeMismatchError, Tensor},
};
