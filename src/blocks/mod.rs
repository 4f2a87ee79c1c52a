//! Computation units over [`Connector`]s.
//!
//! A block reads each input through the [`Usage`] it registered while the graph
//! was built. It writes each output exactly once per forward pass and publishes
//! it with [`Connector::fprop`]. On the way back it reads each output gradient once
//! through [`Connector::bprop`] and hands exactly one contribution to every input
//! it learns through.

pub use embedding::Embedding;
pub use hadamard::Hadamard;
pub use linear::Linear;
pub use logistic::LogisticRegressionCe;
pub use nonlinearity::Nonlinearity;

use crate::{
    error::Error,
    loom::{
        connector::{Connector, GraphProtocolError, Usage},
        context::Context,
        device::Backend,
        tensor::Tensor,
    },
};

mod embedding;
mod hadamard;
mod linear;
mod logistic;
mod nonlinearity;

pub trait Block<B: Backend> {
    /// Enqueues the forward computation and publishes the outputs.
    fn fprop(&mut self) -> Result<(), Error>;

    /// Enqueues the backward computation and hands in the input gradients.
    fn bprop(&mut self) -> Result<(), Error>;

    /// The stream the block runs both passes on.
    fn context(&self) -> &Context<B>;
}

/// How a block reads one of its inputs.
#[derive(Debug, Clone)]
pub enum Input<B: Backend> {
    /// The block contributes a gradient to the producer.
    Learning(Usage<B>),
    /// The block only reads the value.
    Static(Tensor<B>),
}

impl<B: Backend> Input<B> {
    /// Registers a block running on `context` as a reader of `connector`.
    pub fn register(
        connector: &Connector<B>,
        context: &Context<B>,
        learning: bool,
    ) -> Result<Self, GraphProtocolError> {
        match learning {
            true => {
                let usage = connector.register_usage(context.clone(), context.clone())?;
                Ok(Self::Learning(usage))
            }
            false => {
                let value = connector.register_forward_usage(context.clone())?;
                Ok(Self::Static(value))
            }
        }
    }

    #[inline]
    pub fn value(&self) -> &Tensor<B> {
        match self {
            Input::Learning(usage) => usage.value(),
            Input::Static(value) => value,
        }
    }

    /// The gradient slot to write, if the input is learning.
    #[inline]
    pub fn gradient(&self) -> Option<&Tensor<B>> {
        match self {
            Input::Learning(usage) => Some(usage.gradient()),
            Input::Static(_) => None,
        }
    }

    #[inline]
    pub fn is_learning(&self) -> bool {
        matches!(self, Input::Learning(_))
    }

    /// Hands in the gradient written to [`Input::gradient`]. A no-op for static inputs.
    pub fn bprop(&self) -> Result<(), GraphProtocolError> {
        match self {
            Input::Learning(usage) => usage.bprop(),
            Input::Static(_) => Ok(()),
        }
    }
}

/// Creates the output connector of a block running on `context`.
pub(crate) fn output<B: Backend>(
    context: &Context<B>,
    shape: impl Into<crate::loom::tensor::Shape>,
) -> Result<Connector<B>, Error> {
    let value = Tensor::zeros(context.backend(), shape);
    let connector = Connector::builder(value)
        .forward_context(context.clone())
        .build()?;
    Ok(connector)
}
