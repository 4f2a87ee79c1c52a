use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use super::{Backend, BackendKind, DeviceError, DeviceId};
use crate::loom::ops::{TensorOp, check_extent};

/// Host storage of a CPU tensor.
///
/// Kernels read a snapshot and publish a fresh slice, so an input aliasing the
/// output of the same primitive always sees the values from before the launch.
#[derive(Debug, Clone)]
pub struct CpuBuffer(Arc<RwLock<Arc<[f32]>>>);

impl CpuBuffer {
    pub fn zeros(len: usize) -> Self {
        let data: Arc<[f32]> = vec![0.0; len].into();
        Self(Arc::new(RwLock::new(data)))
    }

    /// Takes a snapshot of the current contents.
    #[inline]
    pub fn read(&self) -> Arc<[f32]> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[inline]
    pub fn store(&self, data: impl Into<Arc<[f32]>>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = data.into();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for CpuBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CpuBuffer {}

#[derive(Debug, Clone)]
pub struct Cpu {
    /// The unique identifier of the device.
    id: DeviceId,
    /// Dedicated pool for host kernels; the global pool when absent.
    #[cfg(feature = "rayon")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Backend for Cpu {
    type Buffer = CpuBuffer;

    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    fn alloc(&self, len: usize) -> Self::Buffer {
        CpuBuffer::zeros(len)
    }

    fn launch(&self, op: &TensorOp<Self::Buffer>) -> Result<(), DeviceError> {
        op.validate(BackendKind::Cpu, CpuBuffer::len)?;

        #[cfg(feature = "rayon")]
        crate::loom::platform::install(self.pool.as_deref(), || crate::hal::cpu::execute(op));
        #[cfg(not(feature = "rayon"))]
        crate::hal::cpu::execute(op);

        Ok(())
    }

    fn upload(&self, buffer: &Self::Buffer, data: &[f32]) -> Result<(), DeviceError> {
        let mut contents = buffer.read().to_vec();
        check_extent(BackendKind::Cpu, "upload", contents.len(), data.len())?;
        contents[..data.len()].copy_from_slice(data);
        buffer.store(contents);
        Ok(())
    }

    fn download(&self, buffer: &Self::Buffer, len: usize) -> Result<Vec<f32>, DeviceError> {
        let contents = buffer.read();
        check_extent(BackendKind::Cpu, "download", contents.len(), len)?;
        Ok(contents[..len].to_vec())
    }

    #[inline]
    fn flush(&self) -> Result<(), DeviceError> {
        // host kernels complete before `launch` returns
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CpuBuildError {
    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    /// Number of threads of a dedicated kernel pool.
    pub threads: Option<usize>,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build(self) -> Result<Cpu, CpuBuildError> {
        let id = DeviceId::new();

        #[cfg(feature = "rayon")]
        let pool = match self.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(move |index| format!("braid-cpu-{id}-{index}"))
                    .build()
                    .map_err(|err| CpuBuildError::ThreadPool(err.to_string()))?;
                Some(Arc::new(pool))
            }
            None => None,
        };
        #[cfg(not(feature = "rayon"))]
        if let Some(threads) = self.threads {
            log::warn!("ignoring {threads} kernel threads: built without `rayon`");
        }

        log::info!("created cpu device {id}");
        Ok(Cpu {
            id,
            #[cfg(feature = "rayon")]
            pool,
        })
    }
}
