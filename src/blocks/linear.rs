use super::{Block, Input};
use crate::{
    error::Error,
    loom::{
        connector::Connector,
        context::Context,
        device::Backend,
        ops::Transpose,
        tensor::{Shape, ShapeMismatchError, Tensor},
    },
};

/// `y = W x`, with `W` of shape `(outputs, inputs)` and `x` of shape `(inputs, batch)`.
#[derive(Debug)]
pub struct Linear<B: Backend> {
    context: Context<B>,
    weights: Tensor<B>,
    /// `dL/dW` of the latest backward pass.
    weight_gradient: Tensor<B>,
    input: Input<B>,
    output: Connector<B>,
}

impl<B: Backend> Linear<B> {
    pub fn new(
        context: Context<B>,
        weights: Tensor<B>,
        x: &Connector<B>,
        learning: bool,
    ) -> Result<Self, Error> {
        let x_shape = x.value().shape();
        if weights.ncols() != x_shape.nrows {
            return Err(ShapeMismatchError::Inner {
                op: "linear",
                left: weights.shape(),
                right: x_shape,
            }
            .into());
        }

        let input = Input::register(x, &context, learning)?;
        let output = super::output(&context, Shape::new(weights.nrows(), x_shape.ncols))?;
        let weight_gradient = weights.zeros_like();
        Ok(Self {
            context,
            weights,
            weight_gradient,
            input,
            output,
        })
    }

    #[inline]
    pub fn output(&self) -> &Connector<B> {
        &self.output
    }

    #[inline]
    pub fn weights(&self) -> &Tensor<B> {
        &self.weights
    }

    #[inline]
    pub fn weight_gradient(&self) -> &Tensor<B> {
        &self.weight_gradient
    }
}

impl<B: Backend> Block<B> for Linear<B> {
    fn fprop(&mut self) -> Result<(), Error> {
        let x = self.input.value();
        self.output
            .value()
            .assign_dot(&self.context, (&self.weights, Transpose::N), (x, Transpose::N))?;
        self.output.fprop()?;
        Ok(())
    }

    fn bprop(&mut self) -> Result<(), Error> {
        let context = &self.context;
        let dy = self.output.bprop()?;

        let x = self.input.value();
        self.weight_gradient
            .assign_dot(context, (&dy, Transpose::N), (x, Transpose::T))?;

        if let Some(dx) = self.input.gradient() {
            dx.assign_dot(context, (&self.weights, Transpose::T), (&dy, Transpose::N))?;
            self.input.bprop()?;
        }
        Ok(())
    }

    #[inline]
    fn context(&self) -> &Context<B> {
        &self.context
    }
}
