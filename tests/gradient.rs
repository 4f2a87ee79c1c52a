use std::error::Error;

use braid::{
    Backend, Tensor,
    blocks::Block,
    loom::{context::Context, device::CpuBuilder},
};

mod common;

use common::{Graph, Params};

const EPSILON: f32 = 1e-2;
const TOLERANCE: f64 = 1e-4;

/// Central difference of the loss in every element of `tensor`, written on `context`.
fn numeric_gradient<B: Backend>(
    graph: &mut Graph<B>,
    params: &Params,
    tensor: &Tensor<B>,
    context: &Context<B>,
    values: &[f32],
) -> Result<Vec<f64>, Box<dyn Error>> {
    let mut gradient = Vec::with_capacity(values.len());
    for index in 0..values.len() {
        let mut shifted = values.to_vec();

        shifted[index] = values[index] + EPSILON;
        tensor.assign_host(context, shifted.clone())?;
        let plus = graph.evaluate(&params.labels)?;

        shifted[index] = values[index] - EPSILON;
        tensor.assign_host(context, shifted.clone())?;
        let minus = graph.evaluate(&params.labels)?;

        let step = (values[index] + EPSILON) as f64 - (values[index] - EPSILON) as f64;
        gradient.push((plus - minus) / step);
    }
    tensor.assign_host(context, values.to_vec())?;
    Ok(gradient)
}

fn check(name: &str, analytic: &[f32], numeric: &[f64]) {
    assert_eq!(analytic.len(), numeric.len());
    for (index, (&a, &n)) in analytic.iter().zip(numeric).enumerate() {
        let diff = (a as f64 - n).abs();
        assert!(diff <= TOLERANCE, "{name}[{index}]: analytic {a}, numeric {n}");
    }
}

#[test]
fn test_gradient_check() -> Result<(), Box<dyn Error>> {
    let cpu = CpuBuilder::new().build()?;
    let params = Params::random(42);
    let mut graph = Graph::new(&cpu, &params)?;

    graph.forward()?;
    let analytic = graph.backward()?;

    let weights = graph.linear.weights().clone();
    let context = graph.linear.context().clone();
    let numeric = numeric_gradient(&mut graph, &params, &weights, &context, &params.hidden)?;
    check("hidden", &analytic.hidden, &numeric);

    let weights = graph.loss.weights().clone();
    let context = graph.loss.context().clone();
    let numeric = numeric_gradient(&mut graph, &params, &weights, &context, &params.output)?;
    check("output", &analytic.output, &numeric);

    let x = graph.input.value().clone();
    let context = graph.input.forward_context().clone();
    let numeric = numeric_gradient(&mut graph, &params, &x, &context, &params.x)?;
    check("x", &analytic.x, &numeric);
    Ok(())
}

#[test]
fn test_repeated_passes() -> Result<(), Box<dyn Error>> {
    let cpu = CpuBuilder::new().build()?;
    let params = Params::random(7);
    let mut graph = Graph::new(&cpu, &params)?;

    // gradients are recomputed, never carried over, from one pass to the next
    graph.forward()?;
    let first = graph.backward()?;
    for _ in 0..3 {
        graph.forward()?;
        assert_eq!(graph.backward()?, first);
    }

    // a forward pass without backward leaves nothing torn
    graph.forward()?;
    graph.forward()?;
    assert_eq!(graph.backward()?, first);
    Ok(())
}
