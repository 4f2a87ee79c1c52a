use std::sync::Arc;

use super::update;
use crate::loom::{
    device::CpuBuffer,
    ops::{Axis, Region, Transpose},
};

/// Gathers rows or columns of a `rows × cols` input by index.
pub fn gather(
    axis: Axis,
    [rows, cols]: [usize; 2],
    indices: &Arc<[u32]>,
    transpose: Transpose,
    input: &CpuBuffer,
    output: &CpuBuffer,
) {
    let x = input.read();
    let n = indices.len();
    let at = |i: usize| indices[i] as usize;
    match (axis, transpose) {
        (Axis::Rows, Transpose::N) => update(output, n * cols, |o, _| {
            let (i, c) = (o / cols, o % cols);
            x[at(i) * cols + c]
        }),
        (Axis::Rows, Transpose::T) => update(output, n * cols, |o, _| {
            let (c, i) = (o / n, o % n);
            x[at(i) * cols + c]
        }),
        (Axis::Columns, Transpose::N) => update(output, rows * n, |o, _| {
            let (r, i) = (o / n, o % n);
            x[r * cols + at(i)]
        }),
        (Axis::Columns, Transpose::T) => update(output, rows * n, |o, _| {
            let (i, r) = (o / rows, o % rows);
            x[r * cols + at(i)]
        }),
    }
}

/// Adds `alpha * input` into the indexed rows or columns of a `rows × cols` output.
///
/// Indices are visited in order, so duplicates accumulate deterministically.
pub fn scatter_add(
    axis: Axis,
    [rows, cols]: [usize; 2],
    indices: &Arc<[u32]>,
    alpha: f32,
    input: &CpuBuffer,
    output: &CpuBuffer,
) {
    let x = input.read();
    let mut data = output.read().to_vec();
    let n = indices.len();
    match axis {
        Axis::Rows => {
            for (i, &index) in indices.iter().enumerate() {
                let dst = &mut data[index as usize * cols..][..cols];
                let src = &x[i * cols..][..cols];
                dst.iter_mut().zip(src).for_each(|(y, x)| *y += alpha * x);
            }
        }
        Axis::Columns => {
            for r in 0..rows {
                for (i, &index) in indices.iter().enumerate() {
                    data[r * cols + index as usize] += alpha * x[r * n + i];
                }
            }
        }
    }
    output.store(data);
}

pub fn copy_region(region: &Region, input: &CpuBuffer, output: &CpuBuffer) {
    let x = input.read();
    let mut data = output.read().to_vec();
    let Region {
        rows,
        cols,
        src_stride,
        src_offset,
        dst_stride,
        dst_offset,
    } = *region;
    for r in 0..rows {
        let src = &x[src_offset + r * src_stride..][..cols];
        data[dst_offset + r * dst_stride..][..cols].copy_from_slice(src);
    }
    output.store(data);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{gather, scatter_add};
    use crate::loom::{
        device::CpuBuffer,
        ops::{Axis, Transpose},
    };

    #[test]
    fn test_gather_columns_transposed() {
        // 2 × 3
        let input = CpuBuffer::zeros(6);
        input.store(vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        let indices: Arc<[u32]> = Arc::from([2, 0]);

        let output = CpuBuffer::zeros(4);
        gather(Axis::Columns, [2, 3], &indices, Transpose::N, &input, &output);
        assert_eq!(&output.read()[..], &[2.0, 0.0, 12.0, 10.0]);

        gather(Axis::Columns, [2, 3], &indices, Transpose::T, &input, &output);
        assert_eq!(&output.read()[..], &[2.0, 12.0, 0.0, 10.0]);
    }

    #[test]
    fn test_scatter_duplicates() {
        let output = CpuBuffer::zeros(6);
        let input = CpuBuffer::zeros(4);
        input.store(vec![1.0, 2.0, 3.0, 4.0]);
        let indices: Arc<[u32]> = Arc::from([1, 1]);

        scatter_add(Axis::Rows, [3, 2], &indices, 1.0, &input, &output);
        assert_eq!(&output.read()[..], &[0.0, 0.0, 4.0, 6.0, 0.0, 0.0]);
    }
}
