//! GPU kernels: WGSL compute shaders and the encoder that lowers each [`TensorOp`].

use itertools::Itertools;
use wgpu::util::DeviceExt;

pub use shader::{Pipelines, Shader};

use crate::loom::ops::{Activation, Axis, Region, TensorOp};

mod shader;

/// Threads per workgroup of every kernel.
pub const BLOCK_SIZE: u32 = 64;

/// Records the kernels of one primitive into a command buffer.
pub struct Recorder<'a> {
    device: &'a wgpu::Device,
    pipelines: &'a Pipelines,
    encoder: wgpu::CommandEncoder,
}

impl<'a> Recorder<'a> {
    pub fn new(device: &'a wgpu::Device, pipelines: &'a Pipelines, label: &str) -> Self {
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });
        Self {
            device,
            pipelines,
            encoder,
        }
    }

    /// Allocates a scratch buffer that lives until the submission completes.
    fn temporary(&self, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: (len.max(1) * size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn copy(&mut self, input: &wgpu::Buffer, output: &wgpu::Buffer, len: usize) {
        if len == 0 || input == output {
            return;
        }
        let size = (len * size_of::<f32>()) as u64;
        self.encoder
            .copy_buffer_to_buffer(input, 0, output, 0, size);
    }

    /// Copies the current contents of `buffer` aside.
    fn snapshot(&mut self, buffer: &wgpu::Buffer) -> wgpu::Buffer {
        let len = buffer.size() as usize / size_of::<f32>();
        let output = self.temporary(len);
        self.copy(buffer, &output, len);
        output
    }

    /// Returns `input`, or a snapshot of it if it is the buffer written by the primitive.
    fn unalias(&mut self, input: &wgpu::Buffer, output: &wgpu::Buffer) -> wgpu::Buffer {
        match input == output {
            true => self.snapshot(input),
            false => input.clone(),
        }
    }

    fn indices(&self, indices: &[u32]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("indices"),
                contents: bytemuck::cast_slice(indices),
                usage: wgpu::BufferUsages::STORAGE,
            })
    }

    /// Dispatches `invocations` threads of `shader`.
    ///
    /// Bindings are `params`, then `inputs`, then `outputs`. Inputs that alias an
    /// output are read from a snapshot taken before the dispatch.
    fn dispatch(
        &mut self,
        shader: Shader,
        params: &[u32],
        inputs: &[&wgpu::Buffer],
        outputs: &[&wgpu::Buffer],
        invocations: usize,
    ) {
        if invocations == 0 {
            return;
        }

        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::cast_slice(params),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let inputs = inputs
            .iter()
            .map(|&input| match outputs.contains(&input) {
                true => self.snapshot(input),
                false => input.clone(),
            })
            .collect_vec();
        let buffers = std::iter::once(&params)
            .chain(&inputs)
            .chain(outputs.iter().copied())
            .collect_vec();

        let pipelines = self.pipelines;
        let pipeline = pipelines.get(shader);
        let layout = pipeline.get_bind_group_layout(0);
        let entries = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect_vec();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &layout,
            entries: &entries,
        });

        let max = self.device.limits().max_compute_workgroups_per_dimension;
        let groups = (invocations as u32).div_ceil(BLOCK_SIZE);
        let x = groups.min(max);
        let y = groups.div_ceil(x);

        let label = shader.to_string();
        let mut pass = self
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&label),
                timestamp_writes: None,
            });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }

    pub fn finish(self) -> wgpu::CommandBuffer {
        self.encoder.finish()
    }
}

#[inline]
fn bits(x: f32) -> u32 {
    x.to_bits()
}

/// Lowers one validated primitive into kernel dispatches.
pub fn encode(recorder: &mut Recorder, op: &TensorOp<wgpu::Buffer>) {
    match op {
        &TensorOp::Fill {
            len,
            value,
            ref output,
        } => recorder.dispatch(Shader::Fill, &[len as u32, bits(value)], &[], &[output], len),
        TensorOp::Copy { len, input, output } => recorder.copy(input, output, *len),
        &TensorOp::Axpby {
            len,
            alpha,
            ref input,
            beta,
            ref output,
        } => recorder.dispatch(
            Shader::Axpby,
            &[len as u32, bits(alpha), bits(beta)],
            &[input],
            &[output],
            len,
        ),
        &TensorOp::Activation {
            len,
            activation,
            ref input,
            ref output,
            ref derivative,
        } => {
            let (forward, backward) = match activation {
                Activation::Tanh => (Shader::Tanh, Shader::TanhDer),
                Activation::Sigmoid => (Shader::Sigmoid, Shader::SigmoidDer),
            };
            recorder.dispatch(forward, &[len as u32], &[input], &[output], len);
            if let Some(derivative) = derivative {
                recorder.dispatch(backward, &[len as u32], &[output], &[derivative], len);
            }
        }
        &TensorOp::SumHprod {
            len,
            ref terms,
            alpha,
            beta,
            ref output,
        } => {
            // factors that alias the output must be read before the first accumulation
            let terms = terms
                .iter()
                .map(|factors| {
                    factors
                        .iter()
                        .map(|factor| recorder.unalias(factor, output))
                        .collect_vec()
                })
                .collect_vec();
            if terms.is_empty() {
                recorder.dispatch(Shader::Axpby, &[len as u32, 0, bits(beta)], &[output], &[output], len);
            }
            for (index, factors) in terms.iter().enumerate() {
                let product = match factors.as_slice() {
                    [] => continue,
                    [x] => x.clone(),
                    [x, y, rest @ ..] => {
                        let product = recorder.temporary(len);
                        recorder.dispatch(Shader::Mul, &[len as u32], &[x, y], &[&product], len);
                        for z in rest {
                            recorder.dispatch(Shader::MulAssign, &[len as u32], &[z], &[&product], len);
                        }
                        product
                    }
                };
                let beta = if index == 0 { beta } else { 1.0 };
                recorder.dispatch(
                    Shader::Axpby,
                    &[len as u32, bits(alpha), bits(beta)],
                    &[&product],
                    &[output],
                    len,
                );
            }
        }
        &TensorOp::Sum {
            len,
            ref inputs,
            alpha,
            beta,
            ref output,
        } => {
            let inputs = inputs
                .iter()
                .map(|input| recorder.unalias(input, output))
                .collect_vec();
            if inputs.is_empty() {
                recorder.dispatch(Shader::Axpby, &[len as u32, 0, bits(beta)], &[output], &[output], len);
            }
            for (index, input) in inputs.iter().enumerate() {
                let beta = if index == 0 { beta } else { 1.0 };
                recorder.dispatch(
                    Shader::Axpby,
                    &[len as u32, bits(alpha), bits(beta)],
                    &[input],
                    &[output],
                    len,
                );
            }
        }
        TensorOp::Mask {
            len,
            input,
            mask,
            output,
        } => recorder.dispatch(Shader::Mask, &[*len as u32], &[input, mask], &[output], *len),
        &TensorOp::Dropout {
            len,
            probability,
            ref input,
            ref uniform,
            ref output,
        } => recorder.dispatch(
            Shader::Dropout,
            &[len as u32, bits(probability)],
            &[input, uniform],
            &[output],
            len,
        ),
        &TensorOp::HprodSum {
            rows,
            cols,
            ref a,
            ref b,
            ref output,
        } => recorder.dispatch(
            Shader::HprodSum,
            &[rows as u32, cols as u32],
            &[a, b],
            &[output],
            rows,
        ),
        &TensorOp::ColumnSum {
            rows,
            cols,
            ref input,
            alpha,
            beta,
            ref output,
        } => recorder.dispatch(
            Shader::ColumnSum,
            &[rows as u32, cols as u32, bits(alpha), bits(beta)],
            &[input],
            &[output],
            rows,
        ),
        &TensorOp::Dot {
            m,
            n,
            k,
            ref a,
            trans_a,
            ref b,
            trans_b,
            alpha,
            beta,
            ref output,
        } => {
            let params = [
                m as u32,
                n as u32,
                k as u32,
                trans_a.is_transposed() as u32,
                trans_b.is_transposed() as u32,
                bits(alpha),
                bits(beta),
            ];
            recorder.dispatch(Shader::Dot, &params, &[a, b], &[output], m * n)
        }
        &TensorOp::Gather {
            axis,
            rows,
            cols,
            ref indices,
            transpose,
            ref input,
            ref output,
        } => {
            if indices.is_empty() {
                return;
            }
            let n = indices.len();
            let params = [
                rows as u32,
                cols as u32,
                n as u32,
                transpose.is_transposed() as u32,
            ];
            let indices = recorder.indices(indices);
            let (shader, invocations) = match axis {
                Axis::Rows => (Shader::GatherRows, n * cols),
                Axis::Columns => (Shader::GatherColumns, rows * n),
            };
            recorder.dispatch(shader, &params, &[&indices, input], &[output], invocations)
        }
        &TensorOp::ScatterAdd {
            axis,
            rows,
            cols,
            ref indices,
            alpha,
            ref input,
            ref output,
        } => {
            if indices.is_empty() {
                return;
            }
            let n = indices.len();
            let params = [rows as u32, cols as u32, n as u32, bits(alpha)];
            let indices = recorder.indices(indices);
            let (shader, invocations) = match axis {
                Axis::Rows => (Shader::ScatterRows, cols),
                Axis::Columns => (Shader::ScatterColumns, rows),
            };
            recorder.dispatch(shader, &params, &[&indices, input], &[output], invocations)
        }
        TensorOp::CopyRegion {
            region,
            input,
            output,
        } => {
            let Region {
                rows,
                cols,
                src_stride,
                src_offset,
                dst_stride,
                dst_offset,
            } = *region;
            let params = [rows, cols, src_stride, src_offset, dst_stride, dst_offset].map(|x| x as u32);
            recorder.dispatch(Shader::CopyRegion, &params, &[input], &[output], rows * cols)
        }
    }
}
