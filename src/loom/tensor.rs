use std::sync::Arc;

use derive_more::{Deref, Display};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    context::{Context, Download},
    device::{Backend, DeviceError, DeviceId},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeMismatchError {
    #[error("`{op}`: expected shape {expected}, found {found}")]
    Shape {
        op: &'static str,
        expected: Shape,
        found: Shape,
    },
    #[error("`{op}`: inner dimensions of {left} and {right} do not agree")]
    Inner {
        op: &'static str,
        left: Shape,
        right: Shape,
    },
    #[error("`{op}`: expected {min} to {max} operands, found {found}")]
    Arity {
        op: &'static str,
        min: usize,
        max: usize,
        found: usize,
    },
    #[error("`{op}`: host data of {found} elements does not fill {expected}")]
    Host {
        op: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("cannot reshape {from} into {to}")]
    Reshape { from: Shape, to: Shape },
    #[error("`{op}`: {message}")]
    Argument { op: &'static str, message: String },
    #[error("`{op}`: tensor lives on device {found}, expected device {expected}")]
    Device {
        op: &'static str,
        expected: DeviceId,
        found: DeviceId,
    },
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
#[display("{}", _0.get())]
pub struct TensorId(uid::Id<TensorId>);

/// Dimensions of a row-major matrix.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("({nrows}, {ncols})")]
pub struct Shape {
    pub nrows: usize,
    pub ncols: usize,
}

impl Shape {
    #[inline]
    pub const fn new(nrows: usize, ncols: usize) -> Self {
        Self { nrows, ncols }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.nrows * self.ncols
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub const fn transposed(self) -> Self {
        Self::new(self.ncols, self.nrows)
    }
}

impl From<(usize, usize)> for Shape {
    #[inline]
    fn from((nrows, ncols): (usize, usize)) -> Self {
        Self::new(nrows, ncols)
    }
}

impl From<[usize; 2]> for Shape {
    #[inline]
    fn from([nrows, ncols]: [usize; 2]) -> Self {
        Self::new(nrows, ncols)
    }
}

/// A handle to a matrix living on a backend.
///
/// Cloning is cheap and aliases the storage. Every operation is enqueued on an
/// explicit [`Context`]; the handle itself carries no stream.
#[derive(Debug, Clone)]
pub struct Tensor<B: Backend> {
    id: TensorId,
    shape: Shape,
    backend: B,
    buffer: B::Buffer,
}

impl<B: Backend> Tensor<B> {
    /// Creates a zero-filled tensor.
    pub fn zeros(backend: &B, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let buffer = backend.alloc(shape.len());
        let backend = backend.clone();
        let id = TensorId(uid::Id::new());
        Self {
            id,
            shape,
            backend,
            buffer,
        }
    }

    /// Creates a zero-filled tensor of the same shape on the same backend.
    #[inline]
    pub fn zeros_like(&self) -> Self {
        Self::zeros(&self.backend, self.shape)
    }

    /// Creates a tensor and enqueues the upload of `data` on `context`.
    pub fn from_host(
        context: &Context<B>,
        shape: impl Into<Shape>,
        data: impl Into<Arc<[f32]>>,
    ) -> Result<Self, ShapeMismatchError> {
        let output = Self::zeros(context.backend(), shape);
        output.assign_host(context, data)?;
        Ok(output)
    }

    /// Enqueues an overwrite of the whole tensor with host data.
    pub fn assign_host(
        &self,
        context: &Context<B>,
        data: impl Into<Arc<[f32]>>,
    ) -> Result<(), ShapeMismatchError> {
        let data: Arc<[f32]> = data.into();
        if data.len() != self.len() {
            return Err(ShapeMismatchError::Host {
                op: "assign_host",
                expected: self.len(),
                found: data.len(),
            });
        }
        self.check_device("assign_host", context)?;
        context.upload(self.buffer.clone(), data);
        Ok(())
    }

    /// Enqueues a copy of the tensor back to the host, after all prior work of `context`.
    #[inline]
    ///
    /// A tensor of another device fails the download with [`DeviceError::ForeignDevice`].
    pub fn to_host(&self, context: &Context<B>) -> Download {
        let expected = context.backend().id();
        let found = self.backend.id();
        if expected != found {
            let context = context.id();
            let err = DeviceError::ForeignDevice {
                context,
                expected,
                found,
            };
            return Download::failed(context, err);
        }
        context.download(self.buffer.clone(), self.len())
    }

    /// Views the same storage under another shape of equal size.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self, ShapeMismatchError> {
        let shape = shape.into();
        if shape.len() != self.len() {
            return Err(ShapeMismatchError::Reshape {
                from: self.shape,
                to: shape,
            });
        }
        Ok(Self {
            shape,
            ..self.clone()
        })
    }

    #[inline]
    pub fn id(&self) -> TensorId {
        self.id
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.shape.nrows
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.shape.ncols
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    /// Fails if the tensor lives on another device than `context`.
    pub(crate) fn check_device(
        &self,
        op: &'static str,
        context: &Context<B>,
    ) -> Result<(), ShapeMismatchError> {
        let expected = context.backend().id();
        let found = self.backend.id();
        match expected == found {
            true => Ok(()),
            false => Err(ShapeMismatchError::Device {
                op,
                expected,
                found,
            }),
        }
    }
}
