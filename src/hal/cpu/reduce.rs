use super::{blend, update};
use crate::loom::{device::CpuBuffer, ops::Transpose};

pub fn hprod_sum(rows: usize, cols: usize, a: &CpuBuffer, b: &CpuBuffer, output: &CpuBuffer) {
    let a = a.read();
    let b = b.read();
    update(output, rows, |r, _| {
        let a = &a[r * cols..(r + 1) * cols];
        let b = &b[r * cols..(r + 1) * cols];
        a.iter().zip(b).fold(0.0, |acc, (a, b)| acc + a * b)
    })
}

pub fn column_sum(
    rows: usize,
    cols: usize,
    input: &CpuBuffer,
    alpha: f32,
    beta: f32,
    output: &CpuBuffer,
) {
    let x = input.read();
    update(output, rows, |r, y| {
        let sum = x[r * cols..(r + 1) * cols].iter().fold(0.0, |acc, x| acc + x);
        blend(alpha, sum, beta, y)
    })
}

/// `output (m × n) = alpha * op(a) · op(b) + beta * output`.
pub fn dot(
    [m, n, k]: [usize; 3],
    (a, trans_a): (&CpuBuffer, Transpose),
    (b, trans_b): (&CpuBuffer, Transpose),
    alpha: f32,
    beta: f32,
    output: &CpuBuffer,
) {
    let a = a.read();
    let b = b.read();
    let a_at = |i: usize, p: usize| match trans_a {
        Transpose::N => a[i * k + p],
        Transpose::T => a[p * m + i],
    };
    let b_at = |p: usize, j: usize| match trans_b {
        Transpose::N => b[p * n + j],
        Transpose::T => b[j * k + p],
    };
    update(output, m * n, |index, y| {
        let (i, j) = (index / n, index % n);
        let sum = (0..k).fold(0.0, |acc, p| acc + a_at(i, p) * b_at(p, j));
        blend(alpha, sum, beta, y)
    })
}

#[cfg(test)]
mod tests {
    use super::dot;
    use crate::loom::{device::CpuBuffer, ops::Transpose};

    fn buffer(data: &[f32]) -> CpuBuffer {
        let buffer = CpuBuffer::zeros(data.len());
        buffer.store(data.to_vec());
        buffer
    }

    #[test]
    fn test_dot_transposes() {
        // a: 2 × 3, b: 3 × 2
        let a = buffer(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = buffer(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let output = CpuBuffer::zeros(4);
        dot([2, 2, 3], (&a, Transpose::N), (&b, Transpose::N), 1.0, 0.0, &output);
        assert_eq!(&output.read()[..], &[58.0, 64.0, 139.0, 154.0]);

        // aᵀ a: 3 × 3
        let output = CpuBuffer::zeros(9);
        dot([3, 3, 2], (&a, Transpose::T), (&a, Transpose::N), 1.0, 0.0, &output);
        assert_eq!(
            &output.read()[..],
            &[17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]
        );

        // a aᵀ accumulated twice: 2 × 2
        let output = buffer(&[1.0; 4]);
        dot([2, 2, 3], (&a, Transpose::N), (&a, Transpose::T), 2.0, 1.0, &output);
        assert_eq!(&output.read()[..], &[29.0, 65.0, 65.0, 155.0]);
    }
}
