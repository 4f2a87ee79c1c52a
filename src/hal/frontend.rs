//! Shape-checked tensor operations.
//!
//! Each method checks shapes on the host, then enqueues one or more primitives
//! on the given context and returns immediately. The receiver is the tensor
//! written, except for the split family where it is the tensor read.

use std::sync::Arc;

use itertools::Itertools;

use crate::loom::{
    context::Context,
    device::Backend,
    ops::{Activation, Axis, Region, TensorOp, Transpose},
    tensor::{Shape, ShapeMismatchError, Tensor},
};

/// Factor counts accepted by the Hadamard product family.
const HPROD_ARITY: (usize, usize) = (2, 11);

#[inline]
fn expect_shape(op: &'static str, expected: Shape, found: Shape) -> Result<(), ShapeMismatchError> {
    match expected == found {
        true => Ok(()),
        false => Err(ShapeMismatchError::Shape {
            op,
            expected,
            found,
        }),
    }
}

#[inline]
fn expect_arity(
    op: &'static str,
    (min, max): (usize, usize),
    found: usize,
) -> Result<(), ShapeMismatchError> {
    match (min..=max).contains(&found) {
        true => Ok(()),
        false => Err(ShapeMismatchError::Arity {
            op,
            min,
            max,
            found,
        }),
    }
}

impl<B: Backend> Tensor<B> {
    /// Checks that `self` and every tensor in `others` live on the device of `context`.
    fn check_devices(
        &self,
        op: &'static str,
        context: &Context<B>,
        others: &[&Tensor<B>],
    ) -> Result<(), ShapeMismatchError> {
        self.check_device(op, context)?;
        others
            .iter()
            .try_for_each(|other| other.check_device(op, context))
    }

    fn region_from(&self, x: &Tensor<B>, rows: usize, cols: usize, offset: usize) -> Region {
        Region {
            rows,
            cols,
            src_stride: x.ncols(),
            src_offset: 0,
            dst_stride: self.ncols(),
            dst_offset: offset,
        }
    }

    pub fn fill(&self, context: &Context<B>, value: f32) -> Result<(), ShapeMismatchError> {
        self.check_devices("fill", context, &[])?;
        context.enqueue(TensorOp::Fill {
            len: self.len(),
            value,
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = x`.
    pub fn assign_copy(&self, context: &Context<B>, x: &Tensor<B>) -> Result<(), ShapeMismatchError> {
        expect_shape("assign_copy", self.shape(), x.shape())?;
        self.check_devices("assign_copy", context, &[x])?;
        context.enqueue(TensorOp::Copy {
            len: self.len(),
            input: x.buffer().clone(),
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = alpha * x + beta * self`.
    pub fn axpby(
        &self,
        context: &Context<B>,
        alpha: f32,
        x: &Tensor<B>,
        beta: f32,
    ) -> Result<(), ShapeMismatchError> {
        expect_shape("axpby", self.shape(), x.shape())?;
        self.check_devices("axpby", context, &[x])?;
        context.enqueue(TensorOp::Axpby {
            len: self.len(),
            alpha,
            input: x.buffer().clone(),
            beta,
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = alpha * x`.
    #[inline]
    pub fn assign_scale(
        &self,
        context: &Context<B>,
        alpha: f32,
        x: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        self.axpby(context, alpha, x, 0.0)
    }

    /// `self *= alpha`.
    #[inline]
    pub fn scale(&self, context: &Context<B>, alpha: f32) -> Result<(), ShapeMismatchError> {
        self.axpby(context, alpha, self, 0.0)
    }

    /// `self += alpha * x`.
    #[inline]
    pub fn add_scaled(
        &self,
        context: &Context<B>,
        alpha: f32,
        x: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        self.axpby(context, alpha, x, 1.0)
    }

    /// `self += x`.
    #[inline]
    pub fn add(&self, context: &Context<B>, x: &Tensor<B>) -> Result<(), ShapeMismatchError> {
        self.add_scaled(context, 1.0, x)
    }

    /// `self -= x`.
    #[inline]
    pub fn sub(&self, context: &Context<B>, x: &Tensor<B>) -> Result<(), ShapeMismatchError> {
        self.add_scaled(context, -1.0, x)
    }

    /// `self = alpha * Σ xs + beta * self`.
    pub fn assign_sum(
        &self,
        context: &Context<B>,
        alpha: f32,
        xs: &[&Tensor<B>],
        beta: f32,
    ) -> Result<(), ShapeMismatchError> {
        expect_arity("assign_sum", (1, usize::MAX), xs.len())?;
        xs.iter()
            .try_for_each(|x| expect_shape("assign_sum", self.shape(), x.shape()))?;
        self.check_devices("assign_sum", context, xs)?;
        context.enqueue(TensorOp::Sum {
            len: self.len(),
            inputs: xs.iter().map(|x| x.buffer().clone()).collect(),
            alpha,
            beta,
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = a + b`.
    #[inline]
    pub fn assign_add(
        &self,
        context: &Context<B>,
        a: &Tensor<B>,
        b: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        self.assign_sum(context, 1.0, &[a, b], 0.0)
    }

    /// `self += Σ xs`.
    #[inline]
    pub fn add_sum(&self, context: &Context<B>, xs: &[&Tensor<B>]) -> Result<(), ShapeMismatchError> {
        self.assign_sum(context, 1.0, xs, 1.0)
    }

    /// `self = f(x)`, optionally writing `f'` (in terms of `self`) into `derivative`.
    pub fn assign_activation(
        &self,
        context: &Context<B>,
        activation: Activation,
        x: &Tensor<B>,
        derivative: Option<&Tensor<B>>,
    ) -> Result<(), ShapeMismatchError> {
        let op = match activation {
            Activation::Tanh => "assign_tanh",
            Activation::Sigmoid => "assign_sigmoid",
        };
        expect_shape(op, self.shape(), x.shape())?;
        self.check_devices(op, context, &[x])?;
        if let Some(derivative) = derivative {
            expect_shape(op, self.shape(), derivative.shape())?;
            derivative.check_device(op, context)?;
        }
        context.enqueue(TensorOp::Activation {
            len: self.len(),
            activation,
            input: x.buffer().clone(),
            output: self.buffer().clone(),
            derivative: derivative.map(|d| d.buffer().clone()),
        });
        Ok(())
    }

    #[inline]
    pub fn assign_tanh(
        &self,
        context: &Context<B>,
        x: &Tensor<B>,
        derivative: Option<&Tensor<B>>,
    ) -> Result<(), ShapeMismatchError> {
        self.assign_activation(context, Activation::Tanh, x, derivative)
    }

    #[inline]
    pub fn assign_sigmoid(
        &self,
        context: &Context<B>,
        x: &Tensor<B>,
        derivative: Option<&Tensor<B>>,
    ) -> Result<(), ShapeMismatchError> {
        self.assign_activation(context, Activation::Sigmoid, x, derivative)
    }

    /// `self = alpha * Σ_t Π terms[t] + beta * self`, the fused form of gate updates.
    pub fn assign_sum_hprod(
        &self,
        context: &Context<B>,
        alpha: f32,
        terms: &[&[&Tensor<B>]],
        beta: f32,
    ) -> Result<(), ShapeMismatchError> {
        const OP: &str = "assign_sum_hprod";
        expect_arity(OP, (1, usize::MAX), terms.len())?;
        for factors in terms {
            expect_arity(OP, (1, HPROD_ARITY.1), factors.len())?;
            factors
                .iter()
                .try_for_each(|x| expect_shape(OP, self.shape(), x.shape()))?;
            self.check_devices(OP, context, factors)?;
        }
        let terms = terms
            .iter()
            .map(|factors| factors.iter().map(|x| x.buffer().clone()).collect())
            .collect();
        context.enqueue(TensorOp::SumHprod {
            len: self.len(),
            terms,
            alpha,
            beta,
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = Π factors`, for two to eleven factors.
    pub fn assign_hprod(
        &self,
        context: &Context<B>,
        factors: &[&Tensor<B>],
    ) -> Result<(), ShapeMismatchError> {
        expect_arity("assign_hprod", HPROD_ARITY, factors.len())?;
        self.assign_sum_hprod(context, 1.0, &[factors], 0.0)
    }

    /// `self += alpha * Π factors`.
    pub fn add_hprod(
        &self,
        context: &Context<B>,
        alpha: f32,
        factors: &[&Tensor<B>],
    ) -> Result<(), ShapeMismatchError> {
        expect_arity("add_hprod", HPROD_ARITY, factors.len())?;
        self.assign_sum_hprod(context, alpha, &[factors], 1.0)
    }

    /// `self = x` where `mask` is non-zero, else `0`.
    pub fn assign_masked(
        &self,
        context: &Context<B>,
        x: &Tensor<B>,
        mask: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        expect_shape("assign_masked", self.shape(), x.shape())?;
        expect_shape("assign_masked", self.shape(), mask.shape())?;
        self.check_devices("assign_masked", context, &[x, mask])?;
        context.enqueue(TensorOp::Mask {
            len: self.len(),
            input: x.buffer().clone(),
            mask: mask.buffer().clone(),
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = 0` where `uniform < probability`, else `x`. Survivors are not rescaled.
    pub fn assign_dropout(
        &self,
        context: &Context<B>,
        probability: f32,
        x: &Tensor<B>,
        uniform: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        expect_shape("assign_dropout", self.shape(), x.shape())?;
        expect_shape("assign_dropout", self.shape(), uniform.shape())?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(ShapeMismatchError::Argument {
                op: "assign_dropout",
                message: format!("probability {probability} is outside [0, 1]"),
            });
        }
        self.check_devices("assign_dropout", context, &[x, uniform])?;
        context.enqueue(TensorOp::Dropout {
            len: self.len(),
            probability,
            input: x.buffer().clone(),
            uniform: uniform.buffer().clone(),
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self[r] = Σ_c a[r, c] * b[r, c]`; `self` is a column.
    pub fn assign_hprod_sum(
        &self,
        context: &Context<B>,
        a: &Tensor<B>,
        b: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        expect_shape("assign_hprod_sum", a.shape(), b.shape())?;
        expect_shape("assign_hprod_sum", Shape::new(a.nrows(), 1), self.shape())?;
        self.check_devices("assign_hprod_sum", context, &[a, b])?;
        context.enqueue(TensorOp::HprodSum {
            rows: a.nrows(),
            cols: a.ncols(),
            a: a.buffer().clone(),
            b: b.buffer().clone(),
            output: self.buffer().clone(),
        });
        Ok(())
    }

    fn column_sum(
        &self,
        context: &Context<B>,
        alpha: f32,
        x: &Tensor<B>,
        beta: f32,
    ) -> Result<(), ShapeMismatchError> {
        expect_shape("column_sum", Shape::new(x.nrows(), 1), self.shape())?;
        self.check_devices("column_sum", context, &[x])?;
        context.enqueue(TensorOp::ColumnSum {
            rows: x.nrows(),
            cols: x.ncols(),
            input: x.buffer().clone(),
            alpha,
            beta,
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self[r] = Σ_c x[r, c]`.
    #[inline]
    pub fn assign_column_sum(&self, context: &Context<B>, x: &Tensor<B>) -> Result<(), ShapeMismatchError> {
        self.column_sum(context, 1.0, x, 0.0)
    }

    /// `self[r] += alpha * Σ_c x[r, c]`.
    #[inline]
    pub fn add_column_sum(
        &self,
        context: &Context<B>,
        alpha: f32,
        x: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        self.column_sum(context, alpha, x, 1.0)
    }

    /// `self = alpha * op(a) · op(b) + beta * self`.
    pub fn dot(
        &self,
        context: &Context<B>,
        alpha: f32,
        (a, trans_a): (&Tensor<B>, Transpose),
        (b, trans_b): (&Tensor<B>, Transpose),
        beta: f32,
    ) -> Result<(), ShapeMismatchError> {
        let left = match trans_a {
            Transpose::N => a.shape(),
            Transpose::T => a.shape().transposed(),
        };
        let right = match trans_b {
            Transpose::N => b.shape(),
            Transpose::T => b.shape().transposed(),
        };
        if left.ncols != right.nrows {
            return Err(ShapeMismatchError::Inner {
                op: "dot",
                left,
                right,
            });
        }
        expect_shape("dot", Shape::new(left.nrows, right.ncols), self.shape())?;
        self.check_devices("dot", context, &[a, b])?;
        context.enqueue(TensorOp::Dot {
            m: left.nrows,
            n: right.ncols,
            k: left.ncols,
            a: a.buffer().clone(),
            trans_a,
            b: b.buffer().clone(),
            trans_b,
            alpha,
            beta,
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = op(a) · op(b)`.
    #[inline]
    pub fn assign_dot(
        &self,
        context: &Context<B>,
        a: (&Tensor<B>, Transpose),
        b: (&Tensor<B>, Transpose),
    ) -> Result<(), ShapeMismatchError> {
        self.dot(context, 1.0, a, b, 0.0)
    }

    /// `self += alpha * op(a) · op(b)`.
    #[inline]
    pub fn add_dot(
        &self,
        context: &Context<B>,
        alpha: f32,
        a: (&Tensor<B>, Transpose),
        b: (&Tensor<B>, Transpose),
    ) -> Result<(), ShapeMismatchError> {
        self.dot(context, alpha, a, b, 1.0)
    }

    fn gather(
        &self,
        context: &Context<B>,
        axis: Axis,
        x: &Tensor<B>,
        indices: Arc<[u32]>,
        transpose: Transpose,
    ) -> Result<(), ShapeMismatchError> {
        let op = match axis {
            Axis::Rows => "assign_sliced_rows",
            Axis::Columns => "assign_sliced_columns",
        };
        let n = indices.len();
        let gathered = match axis {
            Axis::Rows => Shape::new(n, x.ncols()),
            Axis::Columns => Shape::new(x.nrows(), n),
        };
        let expected = match transpose {
            Transpose::N => gathered,
            Transpose::T => gathered.transposed(),
        };
        expect_shape(op, expected, self.shape())?;
        self.check_devices(op, context, &[x])?;
        context.enqueue(TensorOp::Gather {
            axis,
            rows: x.nrows(),
            cols: x.ncols(),
            indices,
            transpose,
            input: x.buffer().clone(),
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// `self = x[indices, :]`, or its transpose.
    ///
    /// Out-of-range indices fail the stream asynchronously.
    #[inline]
    pub fn assign_sliced_rows(
        &self,
        context: &Context<B>,
        x: &Tensor<B>,
        indices: &[u32],
        transpose: Transpose,
    ) -> Result<(), ShapeMismatchError> {
        self.gather(context, Axis::Rows, x, indices.into(), transpose)
    }

    /// `self = x[:, indices]`, or its transpose.
    ///
    /// Out-of-range indices fail the stream asynchronously.
    #[inline]
    pub fn assign_sliced_columns(
        &self,
        context: &Context<B>,
        x: &Tensor<B>,
        indices: &[u32],
        transpose: Transpose,
    ) -> Result<(), ShapeMismatchError> {
        self.gather(context, Axis::Columns, x, indices.into(), transpose)
    }

    /// Adds `alpha * dense` into the rows or columns of `self` named by `indices`.
    ///
    /// Duplicate indices accumulate. Out-of-range indices fail the stream asynchronously.
    pub fn sliced_inplace_add(
        &self,
        context: &Context<B>,
        axis: Axis,
        alpha: f32,
        dense: &Tensor<B>,
        indices: &[u32],
    ) -> Result<(), ShapeMismatchError> {
        let n = indices.len();
        let expected = match axis {
            Axis::Rows => Shape::new(n, self.ncols()),
            Axis::Columns => Shape::new(self.nrows(), n),
        };
        expect_shape("sliced_inplace_add", expected, dense.shape())?;
        self.check_devices("sliced_inplace_add", context, &[dense])?;
        context.enqueue(TensorOp::ScatterAdd {
            axis,
            rows: self.nrows(),
            cols: self.ncols(),
            indices: indices.into(),
            alpha,
            input: dense.buffer().clone(),
            output: self.buffer().clone(),
        });
        Ok(())
    }

    /// Broadcasts a row (`axis` rows) or a column (`axis` columns) across `self`.
    pub fn assign_tile(
        &self,
        context: &Context<B>,
        axis: Axis,
        x: &Tensor<B>,
    ) -> Result<(), ShapeMismatchError> {
        match axis {
            Axis::Rows => {
                expect_shape("assign_tile", Shape::new(1, self.ncols()), x.shape())?;
                let indices = vec![0u32; self.nrows()];
                self.gather(context, axis, x, indices.into(), Transpose::N)
            }
            Axis::Columns => {
                expect_shape("assign_tile", Shape::new(self.nrows(), 1), x.shape())?;
                let indices = vec![0u32; self.ncols()];
                self.gather(context, axis, x, indices.into(), Transpose::N)
            }
        }
    }

    /// Stacks `xs` on top of each other into `self`.
    pub fn assign_vstack(&self, context: &Context<B>, xs: &[&Tensor<B>]) -> Result<(), ShapeMismatchError> {
        let nrows = xs.iter().map(|x| x.nrows()).sum();
        expect_shape("assign_vstack", Shape::new(nrows, self.ncols()), self.shape())?;
        xs.iter().try_for_each(|x| {
            expect_shape("assign_vstack", Shape::new(x.nrows(), self.ncols()), x.shape())
        })?;
        self.check_devices("assign_vstack", context, xs)?;

        let mut offset = 0;
        for x in xs {
            let region = self.region_from(x, x.nrows(), x.ncols(), offset * self.ncols());
            context.enqueue(TensorOp::CopyRegion {
                region,
                input: x.buffer().clone(),
                output: self.buffer().clone(),
            });
            offset += x.nrows();
        }
        Ok(())
    }

    /// Places `xs` side by side into `self`.
    pub fn assign_hstack(&self, context: &Context<B>, xs: &[&Tensor<B>]) -> Result<(), ShapeMismatchError> {
        let ncols = xs.iter().map(|x| x.ncols()).sum();
        expect_shape("assign_hstack", Shape::new(self.nrows(), ncols), self.shape())?;
        xs.iter().try_for_each(|x| {
            expect_shape("assign_hstack", Shape::new(self.nrows(), x.ncols()), x.shape())
        })?;
        self.check_devices("assign_hstack", context, xs)?;

        let mut offset = 0;
        for x in xs {
            let region = self.region_from(x, x.nrows(), x.ncols(), offset);
            context.enqueue(TensorOp::CopyRegion {
                region,
                input: x.buffer().clone(),
                output: self.buffer().clone(),
            });
            offset += x.ncols();
        }
        Ok(())
    }

    /// Splits the rows of `self` into `outputs`, in order.
    pub fn vsplit(&self, context: &Context<B>, outputs: &[&Tensor<B>]) -> Result<(), ShapeMismatchError> {
        let nrows = outputs.iter().map(|y| y.nrows()).sum();
        expect_shape("vsplit", Shape::new(nrows, self.ncols()), self.shape())?;
        outputs.iter().try_for_each(|y| {
            expect_shape("vsplit", Shape::new(y.nrows(), self.ncols()), y.shape())
        })?;
        self.check_devices("vsplit", context, outputs)?;

        let mut offset = 0;
        for y in outputs {
            let region = Region {
                rows: y.nrows(),
                cols: y.ncols(),
                src_stride: self.ncols(),
                src_offset: offset * self.ncols(),
                dst_stride: y.ncols(),
                dst_offset: 0,
            };
            context.enqueue(TensorOp::CopyRegion {
                region,
                input: self.buffer().clone(),
                output: y.buffer().clone(),
            });
            offset += y.nrows();
        }
        Ok(())
    }

    /// Splits the columns of `self` into `outputs`, in order.
    pub fn hsplit(&self, context: &Context<B>, outputs: &[&Tensor<B>]) -> Result<(), ShapeMismatchError> {
        let ncols = outputs.iter().map(|y| y.ncols()).sum();
        expect_shape("hsplit", Shape::new(self.nrows(), ncols), self.shape())?;
        outputs.iter().try_for_each(|y| {
            expect_shape("hsplit", Shape::new(self.nrows(), y.ncols()), y.shape())
        })?;
        self.check_devices("hsplit", context, outputs)?;

        let mut offset = 0;
        for y in outputs {
            let region = Region {
                rows: y.nrows(),
                cols: y.ncols(),
                src_stride: self.ncols(),
                src_offset: offset,
                dst_stride: y.ncols(),
                dst_offset: 0,
            };
            context.enqueue(TensorOp::CopyRegion {
                region,
                input: self.buffer().clone(),
                output: y.buffer().clone(),
            });
            offset += y.ncols();
        }
        Ok(())
    }

    /// Gathers the columns of `self` named by `indices`, then splits them into `outputs`.
    pub fn sliced_hsplit(
        &self,
        context: &Context<B>,
        indices: &[u32],
        outputs: &[&Tensor<B>],
    ) -> Result<(), ShapeMismatchError> {
        let ncols: usize = outputs.iter().map(|y| y.ncols()).sum();
        if ncols != indices.len() {
            return Err(ShapeMismatchError::Argument {
                op: "sliced_hsplit",
                message: format!("{} indices for {ncols} output columns", indices.len()),
            });
        }
        outputs.iter().try_for_each(|y| {
            expect_shape("sliced_hsplit", Shape::new(self.nrows(), y.ncols()), y.shape())
        })?;
        self.check_devices("sliced_hsplit", context, outputs)?;

        let mut offset = 0;
        for y in outputs {
            let indices = &indices[offset..offset + y.ncols()];
            y.gather(context, Axis::Columns, self, indices.into(), Transpose::N)?;
            offset += y.ncols();
        }
        Ok(())
    }

    /// Copies `self` into every tensor of `outputs`.
    pub fn sequential_tile(&self, context: &Context<B>, outputs: &[&Tensor<B>]) -> Result<(), ShapeMismatchError> {
        outputs
            .iter()
            .try_for_each(|y| expect_shape("sequential_tile", self.shape(), y.shape()))?;
        self.check_devices("sequential_tile", context, outputs)?;

        for y in outputs {
            context.enqueue(TensorOp::Copy {
                len: self.len(),
                input: self.buffer().clone(),
                output: y.buffer().clone(),
            });
        }
        Ok(())
    }

    /// `self = mean(xs)`.
    pub fn assign_sequential_mean_pooling(
        &self,
        context: &Context<B>,
        xs: &[&Tensor<B>],
    ) -> Result<(), ShapeMismatchError> {
        expect_arity("assign_sequential_mean_pooling", (1, usize::MAX), xs.len())?;
        let alpha = 1.0 / xs.len() as f32;
        self.assign_sum(context, alpha, xs, 0.0)
    }
}

/// Collects tensor handles for the slice-taking operations.
pub fn refs<B: Backend>(tensors: &[Tensor<B>]) -> Vec<&Tensor<B>> {
    tensors.iter().collect_vec()
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use crate::loom::{
        context::Context,
        device::CpuBuilder,
        ops::{Axis, Transpose},
        tensor::{ShapeMismatchError, Tensor},
    };

    fn seq(len: usize, start: f32) -> Vec<f32> {
        (0..len).map(|x| start + x as f32).collect_vec()
    }

    #[test]
    fn test_stack_and_split() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let a = Tensor::from_host(&context, (2, 2), seq(4, 0.0))?;
        let b = Tensor::from_host(&context, (2, 1), seq(2, 10.0))?;

        let h = Tensor::zeros(&cpu, (2, 3));
        h.assign_hstack(&context, &[&a, &b])?;
        assert_eq!(h.to_host(&context).wait()?, vec![0.0, 1.0, 10.0, 2.0, 3.0, 11.0]);

        let v = Tensor::zeros(&cpu, (3, 2));
        let c = Tensor::from_host(&context, (1, 2), seq(2, 20.0))?;
        v.assign_vstack(&context, &[&a, &c])?;
        assert_eq!(v.to_host(&context).wait()?, vec![0.0, 1.0, 2.0, 3.0, 20.0, 21.0]);

        let (x, y) = (Tensor::zeros(&cpu, (2, 1)), Tensor::zeros(&cpu, (2, 2)));
        h.hsplit(&context, &[&x, &y])?;
        assert_eq!(x.to_host(&context).wait()?, vec![0.0, 2.0]);
        assert_eq!(y.to_host(&context).wait()?, vec![1.0, 10.0, 3.0, 11.0]);

        let (x, y) = (Tensor::zeros(&cpu, (1, 2)), Tensor::zeros(&cpu, (2, 2)));
        v.vsplit(&context, &[&x, &y])?;
        assert_eq!(x.to_host(&context).wait()?, vec![0.0, 1.0]);
        assert_eq!(y.to_host(&context).wait()?, vec![2.0, 3.0, 20.0, 21.0]);

        let (x, y) = (Tensor::zeros(&cpu, (2, 1)), Tensor::zeros(&cpu, (2, 2)));
        h.sliced_hsplit(&context, &[2, 0, 0], &[&x, &y])?;
        assert_eq!(x.to_host(&context).wait()?, vec![10.0, 11.0]);
        assert_eq!(y.to_host(&context).wait()?, vec![0.0, 0.0, 2.0, 2.0]);

        assert!(matches!(
            h.hsplit(&context, &[&x]),
            Err(ShapeMismatchError::Shape { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_split_rejects_before_writing() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let other = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let h = Tensor::from_host(&context, (2, 3), seq(6, 1.0))?;
        let x = Tensor::zeros(&cpu, (2, 1));
        let y = Tensor::zeros(&cpu, (3, 1));
        assert!(matches!(
            h.sliced_hsplit(&context, &[2, 0], &[&x, &y]),
            Err(ShapeMismatchError::Shape { .. })
        ));
        let z = Tensor::zeros(&other, (2, 1));
        assert!(matches!(
            h.sliced_hsplit(&context, &[2, 0], &[&x, &z]),
            Err(ShapeMismatchError::Device { .. })
        ));
        assert_eq!(x.to_host(&context).wait()?, vec![0.0; 2]);

        let a = Tensor::from_host(&context, (1, 2), vec![4.0, 5.0])?;
        let ok = Tensor::zeros(&cpu, (1, 2));
        let bad = Tensor::zeros(&cpu, (2, 2));
        assert!(matches!(
            a.sequential_tile(&context, &[&ok, &bad]),
            Err(ShapeMismatchError::Shape { .. })
        ));
        let foreign = Tensor::zeros(&other, (1, 2));
        assert!(matches!(
            a.sequential_tile(&context, &[&ok, &foreign]),
            Err(ShapeMismatchError::Device { .. })
        ));
        assert_eq!(ok.to_host(&context).wait()?, vec![0.0; 2]);

        a.sequential_tile(&context, &[&ok])?;
        assert_eq!(ok.to_host(&context).wait()?, vec![4.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_products() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let a = Tensor::from_host(&context, (1, 3), vec![1.0, 2.0, 3.0])?;
        let b = Tensor::from_host(&context, (1, 3), vec![4.0, 5.0, 6.0])?;
        let c = Tensor::from_host(&context, (1, 3), vec![-1.0, 0.5, 2.0])?;

        let y = Tensor::zeros(&cpu, (1, 3));
        y.assign_hprod(&context, &[&a, &b, &c])?;
        assert_eq!(y.to_host(&context).wait()?, vec![-4.0, 5.0, 36.0]);

        y.add_hprod(&context, 2.0, &[&a, &b])?;
        assert_eq!(y.to_host(&context).wait()?, vec![4.0, 25.0, 72.0]);

        // c = a ∘ b + c ∘ c, in place
        c.assign_sum_hprod(&context, 1.0, &[&[&a, &b], &[&c, &c]], 0.0)?;
        assert_eq!(c.to_host(&context).wait()?, vec![5.0, 10.25, 22.0]);

        let s = Tensor::zeros(&cpu, (1, 1));
        s.assign_hprod_sum(&context, &a, &b)?;
        assert_eq!(s.to_host(&context).wait()?, vec![32.0]);

        assert!(matches!(
            y.assign_hprod(&context, &[&a]),
            Err(ShapeMismatchError::Arity { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reductions() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let x = Tensor::from_host(&context, (2, 3), seq(6, 1.0))?;
        let s = Tensor::from_host(&context, (2, 1), vec![1.0, 1.0])?;
        s.add_column_sum(&context, 0.5, &x)?;
        assert_eq!(s.to_host(&context).wait()?, vec![4.0, 8.5]);

        let xs = (0..4)
            .map(|k| Tensor::from_host(&context, (1, 2), vec![k as f32, 2.0 * k as f32]))
            .collect::<Result<Vec<_>, _>>()?;
        let mean = Tensor::zeros(&cpu, (1, 2));
        mean.assign_sequential_mean_pooling(&context, &super::refs(&xs))?;
        assert_eq!(mean.to_host(&context).wait()?, vec![1.5, 3.0]);

        let outputs = (0..3).map(|_| Tensor::zeros(&cpu, (1, 2))).collect_vec();
        mean.sequential_tile(&context, &super::refs(&outputs))?;
        for y in &outputs {
            assert_eq!(y.to_host(&context).wait()?, vec![1.5, 3.0]);
        }
        Ok(())
    }

    #[test]
    fn test_tile_and_slices() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let bias = Tensor::from_host(&context, (2, 1), vec![1.0, -1.0])?;
        let tiled = Tensor::zeros(&cpu, (2, 3));
        tiled.assign_tile(&context, Axis::Columns, &bias)?;
        assert_eq!(tiled.to_host(&context).wait()?, vec![1.0, 1.0, 1.0, -1.0, -1.0, -1.0]);

        let table = Tensor::from_host(&context, (3, 2), seq(6, 0.0))?;
        let rows = Tensor::zeros(&cpu, (2, 2));
        rows.assign_sliced_rows(&context, &table, &[2, 0], Transpose::T)?;
        assert_eq!(rows.to_host(&context).wait()?, vec![4.0, 0.0, 5.0, 1.0]);

        let dense = Tensor::from_host(&context, (3, 1), vec![1.0, 1.0, 1.0])?;
        table.sliced_inplace_add(&context, Axis::Columns, -1.0, &dense, &[1])?;
        assert_eq!(table.to_host(&context).wait()?, vec![0.0, 0.0, 2.0, 2.0, 4.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_masks() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let x = Tensor::from_host(&context, (1, 4), vec![1.0, 2.0, 3.0, 4.0])?;
        let mask = Tensor::from_host(&context, (1, 4), vec![0.0, 1.0, 0.0, 1.0])?;
        let uniform = Tensor::from_host(&context, (1, 4), vec![0.1, 0.9, 0.5, 0.3])?;

        let y = Tensor::zeros(&cpu, (1, 4));
        y.assign_masked(&context, &x, &mask)?;
        assert_eq!(y.to_host(&context).wait()?, vec![0.0, 2.0, 0.0, 4.0]);

        y.assign_dropout(&context, 0.4, &x, &uniform)?;
        assert_eq!(y.to_host(&context).wait()?, vec![0.0, 2.0, 3.0, 0.0]);

        assert!(matches!(
            y.assign_dropout(&context, 1.5, &x, &uniform),
            Err(ShapeMismatchError::Argument { .. })
        ));
        Ok(())
    }
}
