use std::sync::Arc;

use super::{blend, retain, update};
use crate::loom::{device::CpuBuffer, ops::Activation};

pub fn fill(len: usize, value: f32, output: &CpuBuffer) {
    update(output, len, |_, _| value)
}

pub fn copy(len: usize, input: &CpuBuffer, output: &CpuBuffer) {
    let x = input.read();
    update(output, len, |index, _| x[index])
}

pub fn axpby(len: usize, alpha: f32, input: &CpuBuffer, beta: f32, output: &CpuBuffer) {
    let x = input.read();
    update(output, len, |index, y| blend(alpha, x[index], beta, y))
}

#[inline]
pub fn tanh(x: f32) -> f32 {
    x.tanh()
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn activation(
    len: usize,
    activation: Activation,
    input: &CpuBuffer,
    output: &CpuBuffer,
    derivative: Option<&CpuBuffer>,
) {
    let x = input.read();
    match activation {
        Activation::Tanh => update(output, len, |index, _| tanh(x[index])),
        Activation::Sigmoid => update(output, len, |index, _| sigmoid(x[index])),
    }

    // derivatives are expressed in the activated value
    if let Some(derivative) = derivative {
        let y = output.read();
        match activation {
            Activation::Tanh => update(derivative, len, |index, _| 1.0 - y[index] * y[index]),
            Activation::Sigmoid => update(derivative, len, |index, _| y[index] * (1.0 - y[index])),
        }
    }
}

pub fn sum_hprod(len: usize, terms: &[Vec<CpuBuffer>], alpha: f32, beta: f32, output: &CpuBuffer) {
    let terms: Vec<Vec<Arc<[f32]>>> = terms
        .iter()
        .map(|factors| factors.iter().map(CpuBuffer::read).collect())
        .collect();
    update(output, len, |index, y| {
        let init = retain(beta, y);
        terms.iter().fold(init, |acc, factors| {
            let product = factors[1..]
                .iter()
                .fold(factors[0][index], |p, x| p * x[index]);
            alpha * product + acc
        })
    })
}

pub fn sum(len: usize, inputs: &[CpuBuffer], alpha: f32, beta: f32, output: &CpuBuffer) {
    let inputs: Vec<Arc<[f32]>> = inputs.iter().map(CpuBuffer::read).collect();
    update(output, len, |index, y| {
        let init = retain(beta, y);
        inputs.iter().fold(init, |acc, x| alpha * x[index] + acc)
    })
}

pub fn mask(len: usize, input: &CpuBuffer, mask: &CpuBuffer, output: &CpuBuffer) {
    let x = input.read();
    let mask = mask.read();
    update(output, len, |index, _| match mask[index] != 0.0 {
        true => x[index],
        false => 0.0,
    })
}

/// Zeroes every element whose uniform draw falls below `probability`. Survivors are not rescaled.
pub fn dropout(
    len: usize,
    probability: f32,
    input: &CpuBuffer,
    uniform: &CpuBuffer,
    output: &CpuBuffer,
) {
    let x = input.read();
    let uniform = uniform.read();
    update(output, len, |index, _| match uniform[index] < probability {
        true => 0.0,
        false => x[index],
    })
}

#[cfg(test)]
mod tests {
    use super::{sigmoid, tanh};

    #[test]
    fn test_activation_tails() {
        assert_eq!(tanh(40.0), 1.0);
        assert_eq!(tanh(-40.0), -1.0);
        assert_eq!(sigmoid(-200.0), 0.0);
        assert_eq!(sigmoid(200.0), 1.0);
        assert!((sigmoid(0.0) - 0.5).abs() < f32::EPSILON);
    }
}
