use std::sync::Arc;

use derive_more::Display;

const COMMON: &str = include_str!("shaders/common.wgsl");

/// A compute kernel of the GPU backend.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shader {
    #[display("fill")]
    Fill,
    #[display("axpby")]
    Axpby,
    #[display("tanh")]
    Tanh,
    #[display("tanh_der")]
    TanhDer,
    #[display("sigmoid")]
    Sigmoid,
    #[display("sigmoid_der")]
    SigmoidDer,
    #[display("mul")]
    Mul,
    #[display("mul_assign")]
    MulAssign,
    #[display("mask")]
    Mask,
    #[display("dropout")]
    Dropout,
    #[display("hprod_sum")]
    HprodSum,
    #[display("column_sum")]
    ColumnSum,
    #[display("dot")]
    Dot,
    #[display("gather_rows")]
    GatherRows,
    #[display("gather_columns")]
    GatherColumns,
    #[display("scatter_rows")]
    ScatterRows,
    #[display("scatter_columns")]
    ScatterColumns,
    #[display("copy_region")]
    CopyRegion,
}

impl Shader {
    pub const ALL: [Shader; 18] = [
        Shader::Fill,
        Shader::Axpby,
        Shader::Tanh,
        Shader::TanhDer,
        Shader::Sigmoid,
        Shader::SigmoidDer,
        Shader::Mul,
        Shader::MulAssign,
        Shader::Mask,
        Shader::Dropout,
        Shader::HprodSum,
        Shader::ColumnSum,
        Shader::Dot,
        Shader::GatherRows,
        Shader::GatherColumns,
        Shader::ScatterRows,
        Shader::ScatterColumns,
        Shader::CopyRegion,
    ];

    fn body(self) -> &'static str {
        match self {
            Shader::Fill => include_str!("shaders/fill.wgsl"),
            Shader::Axpby => include_str!("shaders/axpby.wgsl"),
            Shader::Tanh => include_str!("shaders/tanh.wgsl"),
            Shader::TanhDer => include_str!("shaders/tanh_der.wgsl"),
            Shader::Sigmoid => include_str!("shaders/sigmoid.wgsl"),
            Shader::SigmoidDer => include_str!("shaders/sigmoid_der.wgsl"),
            Shader::Mul => include_str!("shaders/mul.wgsl"),
            Shader::MulAssign => include_str!("shaders/mul_assign.wgsl"),
            Shader::Mask => include_str!("shaders/mask.wgsl"),
            Shader::Dropout => include_str!("shaders/dropout.wgsl"),
            Shader::HprodSum => include_str!("shaders/hprod_sum.wgsl"),
            Shader::ColumnSum => include_str!("shaders/column_sum.wgsl"),
            Shader::Dot => include_str!("shaders/dot.wgsl"),
            Shader::GatherRows => include_str!("shaders/gather_rows.wgsl"),
            Shader::GatherColumns => include_str!("shaders/gather_columns.wgsl"),
            Shader::ScatterRows => include_str!("shaders/scatter_rows.wgsl"),
            Shader::ScatterColumns => include_str!("shaders/scatter_columns.wgsl"),
            Shader::CopyRegion => include_str!("shaders/copy_region.wgsl"),
        }
    }

    /// Full WGSL source, with the shared preamble.
    pub fn source(self) -> String {
        format!("{COMMON}{}", self.body())
    }
}

/// One compiled pipeline per [`Shader`], built when the device is.
#[derive(Debug, Clone)]
pub struct Pipelines(Arc<[wgpu::ComputePipeline; Shader::ALL.len()]>);

impl Pipelines {
    pub fn new(device: &wgpu::Device) -> Self {
        let pipelines = Shader::ALL.map(|shader| {
            let label = shader.to_string();
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(shader.source().into()),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        });
        Self(Arc::new(pipelines))
    }

    #[inline]
    pub fn get(&self, shader: Shader) -> &wgpu::ComputePipeline {
        &self.0[shader as usize]
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use naga::valid::{Capabilities, ValidationFlags, Validator};

    use super::Shader;

    #[test]
    fn test_table_order() {
        for (index, shader) in Shader::ALL.into_iter().enumerate() {
            assert_eq!(shader as usize, index, "{shader} is out of place");
            assert!(shader.source().contains("fn main("));
        }
    }

    #[test]
    fn test_sources_validate() -> Result<(), Box<dyn Error>> {
        for shader in Shader::ALL {
            let source = shader.source();
            let module = naga::front::wgsl::parse_str(&source)
                .map_err(|err| format!("{shader}: {}", err.emit_to_string(&source)))?;
            let info = Validator::new(ValidationFlags::all(), Capabilities::all())
                .validate(&module)
                .map_err(|err| format!("{shader}: {}", err.emit_to_string(&source)))?;

            assert_eq!(module.entry_points.len(), 1, "{shader} has extra entry points");
            assert_eq!(module.entry_points[0].name, "main");

            // an implicit layout drops bindings the entry point never reads
            let main = info.get_entry_point(0);
            for (handle, global) in module.global_variables.iter() {
                let Some(binding) = &global.binding else {
                    continue;
                };
                assert!(
                    !main[handle].is_empty(),
                    "{shader} never uses binding {}",
                    binding.binding
                );
            }
        }
        Ok(())
    }
}
