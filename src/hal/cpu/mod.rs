//! Host kernels over flat row-major `f32` slices.
//!
//! Every kernel reads snapshots of its inputs and publishes a new slice for its
//! output, so in-place launches are safe. Callers validate extents first.

use crate::loom::{device::CpuBuffer, ops::TensorOp};

mod elementwise;
mod reduce;
mod structural;

/// Runs one validated primitive to completion.
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all, fields(op = op.name())))]
pub fn execute(op: &TensorOp<CpuBuffer>) {
    match op {
        TensorOp::Fill { len, value, output } => elementwise::fill(*len, *value, output),
        TensorOp::Copy { len, input, output } => elementwise::copy(*len, input, output),
        TensorOp::Axpby {
            len,
            alpha,
            input,
            beta,
            output,
        } => elementwise::axpby(*len, *alpha, input, *beta, output),
        TensorOp::Activation {
            len,
            activation,
            input,
            output,
            derivative,
        } => elementwise::activation(*len, *activation, input, output, derivative.as_ref()),
        TensorOp::SumHprod {
            len,
            terms,
            alpha,
            beta,
            output,
        } => elementwise::sum_hprod(*len, terms, *alpha, *beta, output),
        TensorOp::Sum {
            len,
            inputs,
            alpha,
            beta,
            output,
        } => elementwise::sum(*len, inputs, *alpha, *beta, output),
        TensorOp::Mask {
            len,
            input,
            mask,
            output,
        } => elementwise::mask(*len, input, mask, output),
        TensorOp::Dropout {
            len,
            probability,
            input,
            uniform,
            output,
        } => elementwise::dropout(*len, *probability, input, uniform, output),
        TensorOp::HprodSum {
            rows,
            cols,
            a,
            b,
            output,
        } => reduce::hprod_sum(*rows, *cols, a, b, output),
        TensorOp::ColumnSum {
            rows,
            cols,
            input,
            alpha,
            beta,
            output,
        } => reduce::column_sum(*rows, *cols, input, *alpha, *beta, output),
        TensorOp::Dot {
            m,
            n,
            k,
            a,
            trans_a,
            b,
            trans_b,
            alpha,
            beta,
            output,
        } => reduce::dot([*m, *n, *k], (a, *trans_a), (b, *trans_b), *alpha, *beta, output),
        TensorOp::Gather {
            axis,
            rows,
            cols,
            indices,
            transpose,
            input,
            output,
        } => structural::gather(*axis, [*rows, *cols], indices, *transpose, input, output),
        TensorOp::ScatterAdd {
            axis,
            rows,
            cols,
            indices,
            alpha,
            input,
            output,
        } => structural::scatter_add(*axis, [*rows, *cols], indices, *alpha, input, output),
        TensorOp::CopyRegion {
            region,
            input,
            output,
        } => structural::copy_region(region, input, output),
    }
}

/// Rewrites the first `len` elements of `output`, handing `f` each index and previous value.
fn update<F>(output: &CpuBuffer, len: usize, f: F)
where
    F: Fn(usize, f32) -> f32 + Send + Sync,
{
    let mut data = output.read().to_vec();

    #[cfg(not(feature = "rayon"))]
    data[..len]
        .iter_mut()
        .enumerate()
        .for_each(|(index, y)| *y = f(index, *y));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        data[..len]
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, y)| *y = f(index, *y));
    }

    output.store(data);
}

/// `beta * y`, without reading `y` when `beta` is zero.
#[inline]
fn retain(beta: f32, y: f32) -> f32 {
    match beta == 0.0 {
        true => 0.0,
        false => beta * y,
    }
}

/// `alpha * x + beta * y`, without reading `y` when `beta` is zero.
#[inline]
fn blend(alpha: f32, x: f32, beta: f32, y: f32) -> f32 {
    alpha * x + retain(beta, y)
}
