use itertools::Itertools;

use super::Block;
use crate::{
    error::Error,
    loom::{
        connector::Connector,
        context::Context,
        device::Backend,
        ops::{Axis, Transpose},
        tensor::{Shape, ShapeMismatchError, Tensor},
    },
};

/// Looks up one row of a `(vocabulary, features)` table per sample.
///
/// The output is `(features, batch)`; the backward pass scatter-adds the
/// output gradient into the rows that were read, so repeated indices sum.
#[derive(Debug)]
pub struct Embedding<B: Backend> {
    context: Context<B>,
    table: Tensor<B>,
    table_gradient: Tensor<B>,
    indices: Vec<u32>,
    /// `0..batch`, used to transpose the output gradient.
    columns: Vec<u32>,
    /// The output gradient laid out as `(batch, features)`.
    dense: Tensor<B>,
    output: Connector<B>,
}

impl<B: Backend> Embedding<B> {
    pub fn new(context: Context<B>, table: Tensor<B>, batch: usize) -> Result<Self, Error> {
        let features = table.ncols();
        let output = super::output(&context, Shape::new(features, batch))?;
        let table_gradient = table.zeros_like();
        let dense = Tensor::zeros(context.backend(), Shape::new(batch, features));
        let columns = (0..batch as u32).collect_vec();
        Ok(Self {
            context,
            table,
            table_gradient,
            indices: vec![0; batch],
            columns,
            dense,
            output,
        })
    }

    /// Selects the rows read by the next forward pass, one per sample.
    ///
    /// Indices beyond the table fail the stream when the lookup runs.
    pub fn set_indices(&mut self, indices: &[u32]) -> Result<(), ShapeMismatchError> {
        let batch = self.columns.len();
        if indices.len() != batch {
            return Err(ShapeMismatchError::Host {
                op: "embedding",
                expected: batch,
                found: indices.len(),
            });
        }
        self.indices = indices.to_vec();
        Ok(())
    }

    #[inline]
    pub fn output(&self) -> &Connector<B> {
        &self.output
    }

    #[inline]
    pub fn table(&self) -> &Tensor<B> {
        &self.table
    }

    #[inline]
    pub fn table_gradient(&self) -> &Tensor<B> {
        &self.table_gradient
    }
}

impl<B: Backend> Block<B> for Embedding<B> {
    fn fprop(&mut self) -> Result<(), Error> {
        self.output.value().assign_sliced_rows(
            &self.context,
            &self.table,
            &self.indices,
            Transpose::T,
        )?;
        self.output.fprop()?;
        Ok(())
    }

    fn bprop(&mut self) -> Result<(), Error> {
        let context = &self.context;
        let dy = self.output.bprop()?;
        self.dense
            .assign_sliced_columns(context, &dy, &self.columns, Transpose::T)?;
        self.table_gradient.fill(context, 0.0)?;
        self.table_gradient
            .sliced_inplace_add(context, Axis::Rows, 1.0, &self.dense, &self.indices)?;
        Ok(())
    }

    #[inline]
    fn context(&self) -> &Context<B> {
        &self.context
    }
}
