use derive_more::{Deref, Display};
use thiserror::Error;

use super::{context::ContextId, ops::TensorOp};

pub use cpu::{Cpu, CpuBuffer, CpuBuildError, CpuBuilder};
pub use gpu::{Gpu, GpuBuildError, GpuBuilder};

pub mod cpu;
pub mod gpu;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
#[display("{}", _0.get())]
pub struct DeviceId(uid::Id<DeviceId>);

impl DeviceId {
    #[inline]
    pub(crate) fn new() -> Self {
        Self(uid::Id::new())
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    #[display("cpu")]
    Cpu,
    #[display("gpu")]
    Gpu,
}

/// Backend-specific status reported by a failed primitive.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[display("invalid value")]
    InvalidValue,
    #[display("out of memory")]
    OutOfMemory,
    #[display("validation failure")]
    Validation,
    #[display("internal fault")]
    Internal,
}

impl Status {
    /// Numeric status code, stable across backends.
    pub const fn code(self) -> i32 {
        match self {
            Status::InvalidValue => 1,
            Status::OutOfMemory => 2,
            Status::Validation => 3,
            Status::Internal => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("{backend} primitive `{op}` failed with {status} (code {}): {message}", .status.code())]
    Kernel {
        backend: BackendKind,
        op: &'static str,
        status: Status,
        message: String,
    },
    #[error("stream {context} was poisoned by a failure upstream on stream {upstream}")]
    Poisoned {
        context: ContextId,
        upstream: ContextId,
    },
    #[error("host callback on stream {context} panicked: {message}")]
    Callback { context: ContextId, message: String },
    #[error("stream {context} runs on device {expected} and cannot reach a tensor of device {found}")]
    ForeignDevice {
        context: ContextId,
        expected: DeviceId,
        found: DeviceId,
    },
    #[error("stream {0} is no longer running")]
    Disconnected(ContextId),
    #[error("failed to spawn stream worker: {0}")]
    Spawn(String),
}

impl DeviceError {
    #[inline]
    pub(crate) fn kernel(
        backend: BackendKind,
        op: &'static str,
        status: Status,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self::Kernel {
            backend,
            op,
            status,
            message,
        }
    }

    /// The primitive status, if the error came from a device primitive.
    #[inline]
    pub fn status(&self) -> Option<Status> {
        match self {
            DeviceError::Kernel { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The dispatch contract every backend implements.
///
/// All methods are called from the worker thread of the stream that owns the
/// command, in that stream's enqueue order. [`Backend::launch`] must issue the
/// primitive so that anything launched afterwards, from any stream, observes
/// its result; [`Backend::flush`] must return only once everything issued so
/// far has completed.
pub trait Backend: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Storage handle of a tensor on this backend.
    type Buffer: std::fmt::Debug + Clone + Send + Sync + 'static;

    fn kind(&self) -> BackendKind;

    fn id(&self) -> DeviceId;

    /// Allocates a zero-initialized buffer of `len` floats.
    fn alloc(&self, len: usize) -> Self::Buffer;

    /// Issues one primitive of the kernel catalogue.
    fn launch(&self, op: &TensorOp<Self::Buffer>) -> Result<(), DeviceError>;

    /// Copies host data into the first `data.len()` floats of `buffer`.
    fn upload(&self, buffer: &Self::Buffer, data: &[f32]) -> Result<(), DeviceError>;

    /// Copies the first `len` floats of `buffer` back to the host.
    fn download(&self, buffer: &Self::Buffer, len: usize) -> Result<Vec<f32>, DeviceError>;

    /// Waits until every issued primitive has completed.
    fn flush(&self) -> Result<(), DeviceError>;
}
