//! The kernel catalogue boundary.
//!
//! Every variant of [`TensorOp`] is one numeric primitive: size parameters,
//! scalars and buffer handles, nothing else. Backends match on it exhaustively,
//! so a primitive added here does not compile until every backend implements it.

use std::sync::Arc;

use derive_more::Display;

use super::device::{BackendKind, DeviceError, Status};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    #[display("rows")]
    Rows,
    #[display("columns")]
    Columns,
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transpose {
    #[default]
    #[display("N")]
    N,
    #[display("T")]
    T,
}

impl Transpose {
    #[inline]
    pub fn is_transposed(self) -> bool {
        matches!(self, Transpose::T)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    #[display("tanh")]
    Tanh,
    #[display("sigmoid")]
    Sigmoid,
}

/// A rectangular block copy between two row-major buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub rows: usize,
    pub cols: usize,
    pub src_stride: usize,
    pub src_offset: usize,
    pub dst_stride: usize,
    pub dst_offset: usize,
}

impl Region {
    /// Number of floats a buffer must hold for the source side of the copy.
    #[inline]
    pub fn src_extent(&self) -> usize {
        match self.rows * self.cols {
            0 => 0,
            _ => self.src_offset + (self.rows - 1) * self.src_stride + self.cols,
        }
    }

    /// Number of floats a buffer must hold for the destination side of the copy.
    #[inline]
    pub fn dst_extent(&self) -> usize {
        match self.rows * self.cols {
            0 => 0,
            _ => self.dst_offset + (self.rows - 1) * self.dst_stride + self.cols,
        }
    }
}

/// One primitive of the kernel catalogue, over backend buffers `Buf`.
///
/// Matrices are row-major; `len` counts floats. Ops with `alpha`/`beta` compute
/// `output = alpha * f(..) + beta * output`, and never read `output` when `beta` is zero.
#[derive(Debug, Clone)]
pub enum TensorOp<Buf> {
    Fill {
        len: usize,
        value: f32,
        output: Buf,
    },
    Copy {
        len: usize,
        input: Buf,
        output: Buf,
    },
    Axpby {
        len: usize,
        alpha: f32,
        input: Buf,
        beta: f32,
        output: Buf,
    },
    /// Elementwise activation, optionally writing its derivative as a function of the output.
    Activation {
        len: usize,
        activation: Activation,
        input: Buf,
        output: Buf,
        derivative: Option<Buf>,
    },
    /// Weighted sum of Hadamard products: `alpha * Σ_t Π_f terms[t][f] + beta * output`.
    SumHprod {
        len: usize,
        terms: Vec<Vec<Buf>>,
        alpha: f32,
        beta: f32,
        output: Buf,
    },
    Sum {
        len: usize,
        inputs: Vec<Buf>,
        alpha: f32,
        beta: f32,
        output: Buf,
    },
    Mask {
        len: usize,
        input: Buf,
        mask: Buf,
        output: Buf,
    },
    Dropout {
        len: usize,
        probability: f32,
        input: Buf,
        uniform: Buf,
        output: Buf,
    },
    /// `output[r] = Σ_c a[r, c] * b[r, c]`.
    HprodSum {
        rows: usize,
        cols: usize,
        a: Buf,
        b: Buf,
        output: Buf,
    },
    /// `output[r] = alpha * Σ_c input[r, c] + beta * output[r]`.
    ColumnSum {
        rows: usize,
        cols: usize,
        input: Buf,
        alpha: f32,
        beta: f32,
        output: Buf,
    },
    /// `output (m × n) = alpha * op(a) (m × k) · op(b) (k × n) + beta * output`.
    Dot {
        m: usize,
        n: usize,
        k: usize,
        a: Buf,
        trans_a: Transpose,
        b: Buf,
        trans_b: Transpose,
        alpha: f32,
        beta: f32,
        output: Buf,
    },
    /// Gathers rows or columns of a `rows × cols` input by index.
    Gather {
        axis: Axis,
        rows: usize,
        cols: usize,
        indices: Arc<[u32]>,
        transpose: Transpose,
        input: Buf,
        output: Buf,
    },
    /// Adds `alpha * input` into the rows or columns of a `rows × cols` output by index.
    /// Duplicate indices accumulate.
    ScatterAdd {
        axis: Axis,
        rows: usize,
        cols: usize,
        indices: Arc<[u32]>,
        alpha: f32,
        input: Buf,
        output: Buf,
    },
    CopyRegion {
        region: Region,
        input: Buf,
        output: Buf,
    },
}

impl<Buf> TensorOp<Buf> {
    pub fn name(&self) -> &'static str {
        match self {
            TensorOp::Fill { .. } => "fill",
            TensorOp::Copy { .. } => "copy",
            TensorOp::Axpby { .. } => "axpby",
            TensorOp::Activation {
                activation: Activation::Tanh,
                ..
            } => "tanh",
            TensorOp::Activation {
                activation: Activation::Sigmoid,
                ..
            } => "sigmoid",
            TensorOp::SumHprod { .. } => "sum_hprod",
            TensorOp::Sum { .. } => "sum",
            TensorOp::Mask { .. } => "mask",
            TensorOp::Dropout { .. } => "dropout",
            TensorOp::HprodSum { .. } => "hprod_sum",
            TensorOp::ColumnSum { .. } => "column_sum",
            TensorOp::Dot { .. } => "dot",
            TensorOp::Gather {
                axis: Axis::Rows, ..
            } => "gather_rows",
            TensorOp::Gather {
                axis: Axis::Columns,
                ..
            } => "gather_columns",
            TensorOp::ScatterAdd {
                axis: Axis::Rows, ..
            } => "scatter_rows",
            TensorOp::ScatterAdd {
                axis: Axis::Columns,
                ..
            } => "scatter_columns",
            TensorOp::CopyRegion { .. } => "copy_region",
        }
    }

    /// Checks every buffer extent and index list before a backend touches memory.
    ///
    /// `size` reports how many floats a buffer holds.
    pub(crate) fn validate(
        &self,
        backend: BackendKind,
        size: impl Fn(&Buf) -> usize,
    ) -> Result<(), DeviceError> {
        let op = self.name();
        let check = |buffer: &Buf, required: usize| check_extent(backend, op, size(buffer), required);
        match self {
            TensorOp::Fill { len, output, .. } => check(output, *len),
            TensorOp::Copy { len, input, output }
            | TensorOp::Axpby {
                len, input, output, ..
            } => {
                check(input, *len)?;
                check(output, *len)
            }
            TensorOp::Activation {
                len,
                input,
                output,
                derivative,
                ..
            } => {
                check(input, *len)?;
                check(output, *len)?;
                derivative.iter().try_for_each(|d| check(d, *len))
            }
            TensorOp::SumHprod {
                len, terms, output, ..
            } => {
                terms.iter().flatten().try_for_each(|x| check(x, *len))?;
                check(output, *len)
            }
            TensorOp::Sum {
                len,
                inputs,
                output,
                ..
            } => {
                inputs.iter().try_for_each(|x| check(x, *len))?;
                check(output, *len)
            }
            TensorOp::Mask {
                len,
                input,
                mask,
                output,
            } => {
                check(input, *len)?;
                check(mask, *len)?;
                check(output, *len)
            }
            TensorOp::Dropout {
                len,
                input,
                uniform,
                output,
                ..
            } => {
                check(input, *len)?;
                check(uniform, *len)?;
                check(output, *len)
            }
            TensorOp::HprodSum {
                rows,
                cols,
                a,
                b,
                output,
            } => {
                check(a, rows * cols)?;
                check(b, rows * cols)?;
                check(output, *rows)
            }
            TensorOp::ColumnSum {
                rows,
                cols,
                input,
                output,
                ..
            } => {
                check(input, rows * cols)?;
                check(output, *rows)
            }
            TensorOp::Dot {
                m,
                n,
                k,
                a,
                b,
                output,
                ..
            } => {
                check(a, m * k)?;
                check(b, k * n)?;
                check(output, m * n)
            }
            TensorOp::Gather {
                axis,
                rows,
                cols,
                indices,
                input,
                output,
                ..
            } => {
                check(input, rows * cols)?;
                match axis {
                    Axis::Rows => {
                        check_indices(backend, op, indices, *rows)?;
                        check(output, indices.len() * cols)
                    }
                    Axis::Columns => {
                        check_indices(backend, op, indices, *cols)?;
                        check(output, rows * indices.len())
                    }
                }
            }
            TensorOp::ScatterAdd {
                axis,
                rows,
                cols,
                indices,
                input,
                output,
                ..
            } => {
                check(output, rows * cols)?;
                match axis {
                    Axis::Rows => {
                        check_indices(backend, op, indices, *rows)?;
                        check(input, indices.len() * cols)
                    }
                    Axis::Columns => {
                        check_indices(backend, op, indices, *cols)?;
                        check(input, rows * indices.len())
                    }
                }
            }
            TensorOp::CopyRegion {
                region,
                input,
                output,
            } => {
                check(input, region.src_extent())?;
                check(output, region.dst_extent())
            }
        }
    }
}

/// Checks that every index addresses one of `bound` rows or columns.
pub(crate) fn check_indices(
    backend: BackendKind,
    op: &'static str,
    indices: &[u32],
    bound: usize,
) -> Result<(), DeviceError> {
    match indices.iter().find(|&&index| index as usize >= bound) {
        Some(index) => Err(DeviceError::kernel(
            backend,
            op,
            Status::InvalidValue,
            format!("index {index} out of range for extent {bound}"),
        )),
        None => Ok(()),
    }
}

/// Checks that a buffer of `available` floats covers the `required` extent.
pub(crate) fn check_extent(
    backend: BackendKind,
    op: &'static str,
    available: usize,
    required: usize,
) -> Result<(), DeviceError> {
    match available < required {
        true => Err(DeviceError::kernel(
            backend,
            op,
            Status::InvalidValue,
            format!("buffer of {available} elements accessed up to {required}"),
        )),
        false => Ok(()),
    }
}
