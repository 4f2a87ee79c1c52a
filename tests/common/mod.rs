#![allow(dead_code)]

use braid::{
    Backend, Connector, Context, Error, Tensor,
    blocks::{Block, Linear, LogisticRegressionCe, Nonlinearity},
    loom::ops::Activation,
};

pub const FEATURES: usize = 3;
pub const HIDDEN: usize = 4;
pub const BATCH: usize = 2;

/// Host values of a `Linear → Tanh → LogisticRegressionCe` graph.
#[derive(Debug, Clone)]
pub struct Params {
    pub x: Vec<f32>,
    pub hidden: Vec<f32>,
    pub output: Vec<f32>,
    pub labels: Vec<f32>,
}

impl Params {
    pub fn random(seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut uniform = |len: usize| (0..len).map(|_| rng.f32() - 0.5).collect::<Vec<_>>();
        let x = uniform(FEATURES * BATCH);
        let hidden = uniform(HIDDEN * FEATURES);
        let output = uniform(HIDDEN);
        let labels = (0..BATCH).map(|index| (index % 2) as f32).collect();
        Self {
            x,
            hidden,
            output,
            labels,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub x: Vec<f32>,
    pub hidden: Vec<f32>,
    pub output: Vec<f32>,
}

pub struct Graph<B: Backend> {
    pub input: Connector<B>,
    pub labels: Connector<B>,
    pub linear: Linear<B>,
    pub tanh: Nonlinearity<B>,
    pub loss: LogisticRegressionCe<B>,
}

impl<B: Backend> Graph<B> {
    /// Builds the graph with one stream per block.
    pub fn new(backend: &B, params: &Params) -> Result<Self, Error> {
        let source = Context::new(backend)?;
        let x = Tensor::from_host(&source, (FEATURES, BATCH), params.x.clone())?;
        let y = Tensor::from_host(&source, (1, BATCH), params.labels.clone())?;
        let hidden = Tensor::from_host(&source, (HIDDEN, FEATURES), params.hidden.clone())?;
        let output = Tensor::from_host(&source, (1, HIDDEN), params.output.clone())?;
        source.synchronize()?;

        let input = Connector::builder(x)
            .forward_context(source.clone())
            .build()?;
        let labels = Connector::builder(y)
            .forward_context(source.clone())
            .build()?;

        let linear = Linear::new(Context::new(backend)?, hidden, &input, true)?;
        let tanh = Nonlinearity::new(Context::new(backend)?, Activation::Tanh, linear.output(), true)?;
        let loss = LogisticRegressionCe::new(Context::new(backend)?, output, tanh.output(), &labels, true)?;

        Ok(Self {
            input,
            labels,
            linear,
            tanh,
            loss,
        })
    }

    /// Runs a forward pass and returns the predicted probabilities.
    pub fn forward(&mut self) -> Result<Vec<f32>, Error> {
        self.input.fprop()?;
        self.labels.fprop()?;
        self.linear.fprop()?;
        self.tanh.fprop()?;
        self.loss.fprop()?;
        let probs = self.loss.probs().to_host(self.loss.context()).wait()?;
        Ok(probs)
    }

    /// Runs a backward pass after [`Graph::forward`].
    pub fn backward(&mut self) -> Result<Gradients, Error> {
        self.loss.bprop()?;
        self.tanh.bprop()?;
        self.linear.bprop()?;

        let x = self.input.bprop()?;
        let x = x.to_host(self.input.backward_context()).wait()?;
        let hidden = self
            .linear
            .weight_gradient()
            .to_host(self.linear.context())
            .wait()?;
        let output = self
            .loss
            .weight_gradient()
            .to_host(self.loss.context())
            .wait()?;
        Ok(Gradients { x, hidden, output })
    }

    /// Summed cross-entropy of the latest forward pass.
    pub fn evaluate(&mut self, labels: &[f32]) -> Result<f64, Error> {
        let probs = self.forward()?;
        Ok(cross_entropy(&probs, labels))
    }
}

pub fn cross_entropy(probs: &[f32], labels: &[f32]) -> f64 {
    probs
        .iter()
        .zip(labels)
        .map(|(&p, &y)| {
            let (p, y) = (p as f64, y as f64);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum()
}

pub fn assert_close(name: &str, found: &[f32], expected: &[f32], rtol: f32, atol: f32) {
    assert_eq!(found.len(), expected.len(), "{name}: length");
    for (index, (&a, &b)) in found.iter().zip(expected).enumerate() {
        assert!(
            (a - b).abs() <= atol + rtol * b.abs(),
            "{name}[{index}]: {a} vs {b}"
        );
    }
}
