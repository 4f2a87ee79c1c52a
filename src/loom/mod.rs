//! The `loom` module is the engine core: streams, backends, tensors and the
//! cross-stream gradient protocol.
//!
//! ## Key Components
//! 1. **Execution Contexts**:
//!    - One logical stream per [`Context`](context::Context), drained in order by a dedicated worker.
//!    - [`Event`](context::Event)s order work across streams without blocking the host.
//!    - Host callbacks run once all prior work of the stream has completed.
//!
//! 2. **Backends**:
//!    - The [`Backend`](device::Backend) dispatch contract, implemented by [`Cpu`](device::Cpu) and [`Gpu`](device::Gpu).
//!    - The kernel catalogue [`TensorOp`](ops::TensorOp), matched exhaustively by every backend.
//!    - Sticky asynchronous failures surfaced at synchronization points.
//!
//! 3. **Tensors and Connectors**:
//!    - Row-major `f32` matrices with host transfer and shape-checked operations.
//!    - [`Connector`](connector::Connector)s fan one value out to many consumers and sum their gradients back.

pub mod connector;
pub mod context;
pub mod device;
pub mod ops;
pub mod platform;
pub mod tensor;
