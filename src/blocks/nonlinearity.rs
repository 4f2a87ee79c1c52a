use super::{Block, Input};
use crate::{
    error::Error,
    loom::{
        connector::Connector,
        context::Context,
        device::Backend,
        ops::Activation,
        tensor::Tensor,
    },
};

/// `y = f(x)` for a pointwise activation `f`.
#[derive(Debug)]
pub struct Nonlinearity<B: Backend> {
    context: Context<B>,
    activation: Activation,
    input: Input<B>,
    output: Connector<B>,
    /// `f'(x)`, kept from the forward pass when the input is learning.
    derivative: Tensor<B>,
}

impl<B: Backend> Nonlinearity<B> {
    pub fn new(
        context: Context<B>,
        activation: Activation,
        x: &Connector<B>,
        learning: bool,
    ) -> Result<Self, Error> {
        let input = Input::register(x, &context, learning)?;
        let output = super::output(&context, x.value().shape())?;
        let derivative = x.value().zeros_like();
        Ok(Self {
            context,
            activation,
            input,
            output,
            derivative,
        })
    }

    #[inline]
    pub fn output(&self) -> &Connector<B> {
        &self.output
    }
}

impl<B: Backend> Block<B> for Nonlinearity<B> {
    fn fprop(&mut self) -> Result<(), Error> {
        let derivative = self.input.is_learning().then_some(&self.derivative);
        self.output.value().assign_activation(
            &self.context,
            self.activation,
            self.input.value(),
            derivative,
        )?;
        self.output.fprop()?;
        Ok(())
    }

    fn bprop(&mut self) -> Result<(), Error> {
        let Some(dx) = self.input.gradient() else {
            return Ok(());
        };
        let dy = self.output.bprop()?;
        dx.assign_hprod(&self.context, &[&dy, &self.derivative])?;
        self.input.bprop()?;
        Ok(())
    }

    #[inline]
    fn context(&self) -> &Context<B> {
        &self.context
    }
}
