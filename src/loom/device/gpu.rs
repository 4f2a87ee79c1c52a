use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use super::{Backend, BackendKind, DeviceError, DeviceId, Status};
use crate::{
    hal::gpu::{Pipelines, Recorder},
    loom::ops::{TensorOp, check_extent},
};

#[derive(Debug, Clone)]
pub struct Gpu {
    /// The unique identifier of the device.
    id: DeviceId,
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue, shared by every stream of the device.
    queue: wgpu::Queue,
    /// Compiled kernels.
    pipelines: Pipelines,
    /// The first uncaptured device error.
    errors: Arc<Mutex<Option<DeviceError>>>,
}

impl Gpu {
    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn check(&self) -> Result<(), DeviceError> {
        let errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        match errors.as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn poll(&self, op: &'static str) -> Result<(), DeviceError> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| DeviceError::kernel(BackendKind::Gpu, op, Status::Internal, err.to_string()))?;
        Ok(())
    }
}

#[inline]
fn size(buffer: &wgpu::Buffer) -> usize {
    buffer.size() as usize / size_of::<f32>()
}

impl Backend for Gpu {
    type Buffer = wgpu::Buffer;

    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    fn alloc(&self, len: usize) -> Self::Buffer {
        // zero-sized bindings are invalid
        let size = len.max(1) * size_of::<f32>();
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: size as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    fn launch(&self, op: &TensorOp<Self::Buffer>) -> Result<(), DeviceError> {
        op.validate(BackendKind::Gpu, size)?;

        let mut recorder = Recorder::new(&self.device, &self.pipelines, op.name());
        crate::hal::gpu::encode(&mut recorder, op);
        self.queue.submit(Some(recorder.finish()));
        self.check()
    }

    fn upload(&self, buffer: &Self::Buffer, data: &[f32]) -> Result<(), DeviceError> {
        check_extent(BackendKind::Gpu, "upload", size(buffer), data.len())?;
        if !data.is_empty() {
            self.queue
                .write_buffer(buffer, 0, bytemuck::cast_slice(data));
            self.queue.submit(None);
        }
        self.check()
    }

    fn download(&self, buffer: &Self::Buffer, len: usize) -> Result<Vec<f32>, DeviceError> {
        check_extent(BackendKind::Gpu, "download", size(buffer), len)?;
        if len == 0 {
            return Ok(vec![]);
        }

        let (sender, receiver) = flume::bounded(1);
        let slice = buffer.slice(..(len * size_of::<f32>()) as u64);
        wgpu::util::DownloadBuffer::read_buffer(&self.device, &self.queue, &slice, move |data| {
            let data = data.map(|data| bytemuck::pod_collect_to_vec::<u8, f32>(&data));
            _ = sender.send(data)
        });
        self.poll("download")?;

        let failed = |message: String| DeviceError::kernel(BackendKind::Gpu, "download", Status::Internal, message);
        let data = receiver
            .recv()
            .map_err(|err| failed(err.to_string()))?
            .map_err(|err| failed(err.to_string()))?;
        self.check()?;
        Ok(data)
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.poll("flush")?;
        self.check()
    }
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request adaptor")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
}

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        let features = wgpu::Features::empty();
        let limits = adapter.limits();
        Self {
            adapter,
            features,
            limits,
        }
    }

    /// Requests an adapter of the given power preference from the default instance.
    pub async fn request(power_preference: wgpu::PowerPreference) -> Result<Self, GpuBuildError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;
        Ok(Self::new(adapter))
    }

    pub async fn build(self) -> Result<Gpu, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
        } = self;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let errors: Arc<Mutex<Option<DeviceError>>> = Default::default();
        let sink = errors.clone();
        device.on_uncaptured_error(Box::new(move |err: wgpu::Error| {
            let status = match &err {
                wgpu::Error::OutOfMemory { .. } => Status::OutOfMemory,
                wgpu::Error::Validation { .. } => Status::Validation,
                #[allow(unreachable_patterns)]
                _ => Status::Internal,
            };
            let err = DeviceError::kernel(BackendKind::Gpu, "submit", status, err.to_string());
            log::error!("{err}");
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(err);
        }));

        let pipelines = Pipelines::new(&device);
        let id = DeviceId::new();
        let info = adapter.get_info();
        log::info!("created gpu device {id} on {} ({:?})", info.name, info.backend);

        Ok(Gpu {
            id,
            device,
            queue,
            pipelines,
            errors,
        })
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::GpuBuilder;
    use crate::loom::{context::Context, device::Status, ops::Transpose, tensor::Tensor};

    #[tokio::test]
    async fn test_gpu_roundtrip_and_fault() -> Result<(), Box<dyn Error>> {
        let gpu = match GpuBuilder::request(wgpu::PowerPreference::None).await {
            Ok(builder) => builder.build().await?,
            Err(err) => {
                log::warn!("skipping gpu test: {err}");
                return Ok(());
            }
        };
        let context = Context::new(&gpu)?;

        let x = Tensor::from_host(&context, (2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        x.scale(&context, 0.5)?;
        let output = x.to_host(&context).wait_async().await?;
        assert_eq!(output, vec![0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);

        let y = Tensor::zeros(&gpu, (2, 1));
        y.assign_sliced_columns(&context, &x, &[7], Transpose::N)?;
        let err = context.synchronize_async().await.unwrap_err();
        assert_eq!(err.status(), Some(Status::InvalidValue));
        Ok(())
    }
}
