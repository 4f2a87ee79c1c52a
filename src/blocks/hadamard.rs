use super::{Block, Input};
use crate::{
    error::Error,
    loom::{connector::Connector, context::Context, device::Backend, tensor::ShapeMismatchError},
};

/// `y = a ∘ b`.
#[derive(Debug)]
pub struct Hadamard<B: Backend> {
    context: Context<B>,
    a: Input<B>,
    b: Input<B>,
    output: Connector<B>,
}

impl<B: Backend> Hadamard<B> {
    pub fn new(
        context: Context<B>,
        a: &Connector<B>,
        b: &Connector<B>,
        learning: bool,
    ) -> Result<Self, Error> {
        let shape = a.value().shape();
        if shape != b.value().shape() {
            return Err(ShapeMismatchError::Shape {
                op: "hadamard",
                expected: shape,
                found: b.value().shape(),
            }
            .into());
        }

        let a = Input::register(a, &context, learning)?;
        let b = Input::register(b, &context, learning)?;
        let output = super::output(&context, shape)?;
        Ok(Self {
            context,
            a,
            b,
            output,
        })
    }

    #[inline]
    pub fn output(&self) -> &Connector<B> {
        &self.output
    }
}

impl<B: Backend> Block<B> for Hadamard<B> {
    fn fprop(&mut self) -> Result<(), Error> {
        let (a, b) = (self.a.value(), self.b.value());
        self.output.value().assign_hprod(&self.context, &[a, b])?;
        self.output.fprop()?;
        Ok(())
    }

    fn bprop(&mut self) -> Result<(), Error> {
        if !self.a.is_learning() {
            return Ok(());
        }
        let context = &self.context;
        let dy = self.output.bprop()?;

        // da = dy ∘ b, db = dy ∘ a
        for (input, other) in [(&self.a, &self.b), (&self.b, &self.a)] {
            if let Some(dx) = input.gradient() {
                dx.assign_hprod(context, &[&dy, other.value()])?;
                input.bprop()?;
            }
        }
        Ok(())
    }

    #[inline]
    fn context(&self) -> &Context<B> {
        &self.context
    }
}
