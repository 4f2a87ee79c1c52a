use thiserror::Error;

use crate::loom::{connector::GraphProtocolError, device::DeviceError, tensor::ShapeMismatchError};

/// Any failure of the engine a block or an orchestrator can observe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    GraphProtocol(#[from] GraphProtocolError),
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
