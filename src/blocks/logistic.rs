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

/// Logistic regression with cross-entropy loss: `p = σ(w h)`.
///
/// The loss `-Σ y ln p + (1 - y) ln(1 - p)` is summed over the batch, so the
/// gradient at the logits is `p - y`. The block terminates a graph: it starts
/// the backward pass instead of reading an output gradient.
#[derive(Debug)]
pub struct LogisticRegressionCe<B: Backend> {
    context: Context<B>,
    weights: Tensor<B>,
    weight_gradient: Tensor<B>,
    input: Input<B>,
    labels: Tensor<B>,
    probs: Tensor<B>,
    /// `dL/dz`.
    delta: Tensor<B>,
}

impl<B: Backend> LogisticRegressionCe<B> {
    /// `weights` is `(classes, features)`, `h` is `(features, batch)` and `labels` is `(classes, batch)`.
    pub fn new(
        context: Context<B>,
        weights: Tensor<B>,
        h: &Connector<B>,
        labels: &Connector<B>,
        learning: bool,
    ) -> Result<Self, Error> {
        let h_shape = h.value().shape();
        if weights.ncols() != h_shape.nrows {
            return Err(ShapeMismatchError::Inner {
                op: "logistic_regression",
                left: weights.shape(),
                right: h_shape,
            }
            .into());
        }
        let shape = Shape::new(weights.nrows(), h_shape.ncols);
        if labels.value().shape() != shape {
            return Err(ShapeMismatchError::Shape {
                op: "logistic_regression",
                expected: shape,
                found: labels.value().shape(),
            }
            .into());
        }

        let input = Input::register(h, &context, learning)?;
        let labels = labels.register_forward_usage(context.clone())?;
        let backend = context.backend();
        let probs = Tensor::zeros(backend, shape);
        let delta = Tensor::zeros(backend, shape);
        let weight_gradient = weights.zeros_like();
        Ok(Self {
            context,
            weights,
            weight_gradient,
            input,
            labels,
            probs,
            delta,
        })
    }

    /// Predicted probabilities of the latest forward pass.
    #[inline]
    pub fn probs(&self) -> &Tensor<B> {
        &self.probs
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

impl<B: Backend> Block<B> for LogisticRegressionCe<B> {
    fn fprop(&mut self) -> Result<(), Error> {
        let context = &self.context;
        let h = self.input.value();
        // the logits go through `probs` in place
        self.probs
            .assign_dot(context, (&self.weights, Transpose::N), (h, Transpose::N))?;
        self.probs.assign_sigmoid(context, &self.probs, None)?;
        Ok(())
    }

    fn bprop(&mut self) -> Result<(), Error> {
        let context = &self.context;
        self.delta.assign_copy(context, &self.probs)?;
        self.delta.sub(context, &self.labels)?;

        let h = self.input.value();
        self.weight_gradient
            .assign_dot(context, (&self.delta, Transpose::N), (h, Transpose::T))?;

        if let Some(dh) = self.input.gradient() {
            dh.assign_dot(context, (&self.weights, Transpose::T), (&self.delta, Transpose::N))?;
            self.input.bprop()?;
        }
        Ok(())
    }

    #[inline]
    fn context(&self) -> &Context<B> {
        &self.context
    }
}
