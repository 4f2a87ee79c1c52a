//! Execution contexts: one logical stream per context, one worker thread per stream.
//!
//! A context owns an unbounded `flume` channel of [`Command`]s. The worker drains
//! it in order, so enqueue order is execution order. Nothing here blocks the
//! caller except [`Context::synchronize`] and [`Download::wait`]; cross-stream
//! ordering is expressed with [`Event`]s.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Condvar, Mutex, PoisonError},
};

use derive_more::{Deref, Display};

use super::{
    device::{Backend, DeviceError},
    ops::TensorOp,
    platform,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
#[display("{}", _0.get())]
pub struct ContextId(uid::Id<ContextId>);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
#[display("{}", _0.get())]
pub struct EventId(uid::Id<EventId>);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    #[default]
    Pending,
    Complete,
    /// The recording stream had failed; nothing before the event can be trusted.
    Poisoned,
}

#[derive(Debug, Default)]
struct EventInner {
    state: Mutex<EventState>,
    signal: Condvar,
}

/// A marker recorded on one stream that other streams can wait on.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    context: ContextId,
    inner: Arc<EventInner>,
}

impl Event {
    fn new(context: ContextId) -> Self {
        Self {
            id: EventId(uid::Id::new()),
            context,
            inner: Default::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// The context the event was recorded on.
    #[inline]
    pub fn context(&self) -> ContextId {
        self.context
    }

    #[inline]
    pub fn state(&self) -> EventState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state() == EventState::Complete
    }

    /// Blocks until the event leaves [`EventState::Pending`].
    pub fn wait(&self) -> EventState {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .inner
            .signal
            .wait_while(state, |state| *state == EventState::Pending)
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    fn settle(&self, value: EventState) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == EventState::Pending {
            *state = value;
            self.inner.signal.notify_all();
        }
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Command<B: Backend> {
    Launch(TensorOp<B::Buffer>),
    Upload {
        buffer: B::Buffer,
        data: Arc<[f32]>,
    },
    Download {
        buffer: B::Buffer,
        len: usize,
        sender: flume::Sender<Result<Vec<f32>, DeviceError>>,
    },
    Callback(Callback),
    Record(Event),
    Wait(Event),
    Synchronize(flume::Sender<Result<(), DeviceError>>),
}

struct ContextInner<B: Backend> {
    id: ContextId,
    backend: B,
    sender: flume::Sender<Command<B>>,
}

/// A handle to one logical asynchronous execution stream.
///
/// Clones share the stream. The worker exits once every handle is dropped and
/// the remaining commands are drained; dropping never synchronizes.
pub struct Context<B: Backend> {
    inner: Arc<ContextInner<B>>,
}

impl<B: Backend> Clone for Context<B> {
    fn clone(&self) -> Self {
        let inner = self.inner.clone();
        Self { inner }
    }
}

impl<B: Backend> std::fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend)
            .finish()
    }
}

impl<B: Backend> PartialEq for Context<B> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<B: Backend> Eq for Context<B> {}

impl<B: Backend> std::hash::Hash for Context<B> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<B: Backend> Context<B> {
    /// Creates a stream on `backend` and starts its worker.
    pub fn new(backend: &B) -> Result<Self, DeviceError> {
        let id = ContextId(uid::Id::new());
        let (sender, receiver) = flume::unbounded();

        let worker = Worker {
            id,
            backend: backend.clone(),
            receiver,
            error: None,
        };
        let name = format!("braid-{}-stream-{id}", backend.kind());
        platform::spawn(name, move || worker.serve())
            .map_err(|err| DeviceError::Spawn(err.to_string()))?;
        log::debug!("created {} stream {id}", backend.kind());

        let backend = backend.clone();
        let inner = Arc::new(ContextInner {
            id,
            backend,
            sender,
        });
        Ok(Self { inner })
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    fn send(&self, command: Command<B>) {
        let Err(flume::SendError(command)) = self.inner.sender.send(command) else {
            return;
        };
        log::error!("stream {} is not running; command dropped", self.id());
        // waiters of an event nobody will record must not hang
        if let Command::Record(event) = command {
            event.settle(EventState::Poisoned);
        }
    }

    /// Submits a primitive for asynchronous execution on this stream. Never blocks.
    #[inline]
    pub fn enqueue(&self, op: TensorOp<B::Buffer>) {
        self.send(Command::Launch(op))
    }

    pub(crate) fn upload(&self, buffer: B::Buffer, data: Arc<[f32]>) {
        self.send(Command::Upload { buffer, data })
    }

    pub(crate) fn download(&self, buffer: B::Buffer, len: usize) -> Download {
        let (sender, receiver) = flume::bounded(1);
        self.send(Command::Download {
            buffer,
            len,
            sender,
        });
        let context = self.id();
        Download { context, receiver }
    }

    /// Schedules `f` to run on the host once every operation enqueued so far has completed.
    ///
    /// Callbacks of one context run in enqueue order on the stream's worker thread.
    /// They are skipped if the stream has failed, and must not block on other streams.
    pub fn add_callback<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Callback(Box::new(f)))
    }

    /// Records a point in this stream that other streams can [`wait_event`](Self::wait_event) on.
    pub fn record_event(&self) -> Event {
        let event = Event::new(self.id());
        log::trace!("stream {} records event {}", self.id(), event.id());
        self.send(Command::Record(event.clone()));
        event
    }

    /// Makes work enqueued after this call wait for `event`.
    ///
    /// Only this stream waits; the caller and unrelated streams keep running.
    /// Waiting on an event of the same stream is a no-op.
    pub fn wait_event(&self, event: &Event) {
        if event.context() == self.id() {
            return;
        }
        log::trace!("stream {} waits on event {}", self.id(), event.id());
        self.send(Command::Wait(event.clone()))
    }

    /// Blocks until every operation and callback enqueued so far has completed.
    ///
    /// Returns the first device failure of this stream, if any.
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        self.send(Command::Synchronize(sender));
        receiver
            .recv()
            .map_err(|_| DeviceError::Disconnected(self.id()))?
    }

    /// Awaitable form of [`Context::synchronize`].
    pub async fn synchronize_async(&self) -> Result<(), DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        self.send(Command::Synchronize(sender));
        receiver
            .recv_async()
            .await
            .map_err(|_| DeviceError::Disconnected(self.id()))?
    }
}

/// Host data pending on a stream.
#[derive(Debug)]
#[must_use = "a download does nothing unless waited on"]
pub struct Download {
    context: ContextId,
    receiver: flume::Receiver<Result<Vec<f32>, DeviceError>>,
}

impl Download {
    /// A download that fails with `err` without touching the stream.
    pub(crate) fn failed(context: ContextId, err: DeviceError) -> Self {
        let (sender, receiver) = flume::bounded(1);
        _ = sender.send(Err(err));
        Self { context, receiver }
    }

    /// Blocks until the stream has produced the data.
    pub fn wait(self) -> Result<Vec<f32>, DeviceError> {
        self.receiver
            .recv()
            .map_err(|_| DeviceError::Disconnected(self.context))?
    }

    pub async fn wait_async(self) -> Result<Vec<f32>, DeviceError> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| DeviceError::Disconnected(self.context))?
    }
}

struct Worker<B: Backend> {
    id: ContextId,
    backend: B,
    receiver: flume::Receiver<Command<B>>,
    /// The first failure of the stream. Once set, device work is skipped.
    error: Option<DeviceError>,
}

impl<B: Backend> Worker<B> {
    fn serve(mut self) {
        log::debug!("stream {} started", self.id);
        while let Ok(command) = self.receiver.recv() {
            self.handle(command);
        }
        log::debug!("stream {} stopped", self.id);
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(stream = %self.id)))]
    fn handle(&mut self, command: Command<B>) {
        match command {
            Command::Launch(op) => self.run(|backend| backend.launch(&op)),
            Command::Upload { buffer, data } => self.run(|backend| backend.upload(&buffer, &data)),
            Command::Download {
                buffer,
                len,
                sender,
            } => {
                let data = self.try_run(|backend| {
                    backend.flush()?;
                    backend.download(&buffer, len)
                });
                _ = sender.send(data);
            }
            Command::Callback(f) => {
                self.run(|backend| backend.flush());
                match &self.error {
                    Some(err) => log::warn!("skipping callback on failed stream {}: {err}", self.id),
                    None => {
                        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
                            let message = panic_message(payload.as_ref());
                            self.fail(DeviceError::Callback {
                                context: self.id,
                                message,
                            });
                        }
                    }
                }
            }
            Command::Record(event) => match self.error {
                Some(_) => event.settle(EventState::Poisoned),
                None => event.settle(EventState::Complete),
            },
            Command::Wait(event) => {
                if self.error.is_some() {
                    return;
                }
                if event.wait() == EventState::Poisoned {
                    self.fail(DeviceError::Poisoned {
                        context: self.id,
                        upstream: event.context(),
                    });
                }
            }
            Command::Synchronize(sender) => {
                self.run(|backend| backend.flush());
                let status = match &self.error {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                };
                _ = sender.send(status);
            }
        }
    }

    fn try_run<T>(
        &mut self,
        f: impl FnOnce(&B) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        f(&self.backend).inspect_err(|err| self.fail(err.clone()))
    }

    #[inline]
    fn run(&mut self, f: impl FnOnce(&B) -> Result<(), DeviceError>) {
        _ = self.try_run(f);
    }

    fn fail(&mut self, err: DeviceError) {
        log::error!("stream {} failed: {err}", self.id);
        self.error.get_or_insert(err);
    }
}

impl<B: Backend> Drop for Worker<B> {
    fn drop(&mut self) {
        // a worker unwinding with commands still queued must not leave waiters hanging
        for command in self.receiver.drain() {
            if let Command::Record(event) = command {
                event.settle(EventState::Poisoned);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    match (payload.downcast_ref::<&str>(), payload.downcast_ref::<String>()) {
        (Some(message), _) => message.to_string(),
        (_, Some(message)) => message.clone(),
        _ => "unknown panic".into(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        sync::{Arc, Mutex},
    };

    use super::{Context, ContextId, ContextInner, EventState};
    use crate::loom::{
        device::{CpuBuilder, DeviceError, Status},
        ops::{Axis, Transpose, TensorOp},
        tensor::{Shape, Tensor},
    };

    #[test]
    fn test_callbacks_in_order() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let log = Arc::new(Mutex::new(vec![]));
        for index in 0..16 {
            let log = log.clone();
            context.add_callback(move || log.lock().unwrap().push(index));
        }
        context.synchronize()?;

        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_callback_after_work() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let x = Tensor::zeros(&cpu, Shape::new(2, 3));
        x.fill(&context, 7.0)?;

        let seen = Arc::new(Mutex::new(vec![]));
        let buffer = x.buffer().clone();
        {
            let seen = seen.clone();
            context.add_callback(move || *seen.lock().unwrap() = buffer.read().to_vec());
        }
        context.synchronize()?;

        assert_eq!(*seen.lock().unwrap(), vec![7.0; 6]);
        Ok(())
    }

    #[test]
    fn test_event_orders_streams() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let producer = Context::new(&cpu)?;
        let consumer = Context::new(&cpu)?;

        let x = Tensor::zeros(&cpu, Shape::new(64, 64));
        let y = Tensor::zeros(&cpu, Shape::new(64, 64));
        for _ in 0..8 {
            x.add_scaled(&producer, 1.0, &Tensor::from_host(&producer, x.shape(), vec![1.0; 4096])?)?;
        }
        let event = producer.record_event();
        consumer.wait_event(&event);
        y.assign_scale(&consumer, 2.0, &x)?;

        let output = y.to_host(&consumer).wait()?;
        assert!(output.iter().all(|&v| v == 16.0));
        assert_eq!(event.state(), EventState::Complete);
        Ok(())
    }

    #[test]
    fn test_sticky_error() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;

        let table = Tensor::zeros(&cpu, Shape::new(4, 2));
        let rows = Tensor::zeros(&cpu, Shape::new(2, 2));
        rows.assign_sliced_rows(&context, &table, &[0, 9], Transpose::N)?;
        table.fill(&context, 1.0)?;

        let fired = Arc::new(Mutex::new(false));
        {
            let fired = fired.clone();
            context.add_callback(move || *fired.lock().unwrap() = true);
        }

        let err = context.synchronize().unwrap_err();
        assert_eq!(err.status(), Some(Status::InvalidValue));
        assert!(!*fired.lock().unwrap());

        // the failure is not recoverable
        assert_eq!(context.synchronize(), Err(err.clone()));
        assert_eq!(table.to_host(&context).wait(), Err(err));
        Ok(())
    }

    #[test]
    fn test_poison_propagates() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let producer = Context::new(&cpu)?;
        let consumer = Context::new(&cpu)?;

        let table = Tensor::zeros(&cpu, Shape::new(4, 2));
        let dense = Tensor::zeros(&cpu, Shape::new(1, 2));
        table.sliced_inplace_add(&producer, Axis::Rows, 1.0, &dense, &[4])?;
        let event = producer.record_event();
        consumer.wait_event(&event);

        match consumer.synchronize() {
            Err(DeviceError::Poisoned { context, upstream }) => {
                assert_eq!(context, consumer.id());
                assert_eq!(upstream, producer.id());
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(event.state(), EventState::Poisoned);
        Ok(())
    }

    #[test]
    fn test_callback_panic() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;
        context.add_callback(|| panic!("metric exploded"));
        match context.synchronize() {
            Err(DeviceError::Callback { message, .. }) => assert_eq!(message, "metric exploded"),
            other => panic!("unexpected status: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_raw_enqueue() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;
        let x = Tensor::zeros(&cpu, Shape::new(1, 4));
        context.enqueue(TensorOp::Fill {
            len: 4,
            value: 0.5,
            output: x.buffer().clone(),
        });
        assert_eq!(x.to_host(&context).wait()?, vec![0.5; 4]);
        Ok(())
    }

    #[tokio::test]
    async fn test_synchronize_async() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let context = Context::new(&cpu)?;
        let x = Tensor::from_host(&context, Shape::new(2, 2), vec![1.0, 2.0, 3.0, 4.0])?;
        x.scale(&context, 3.0)?;
        context.synchronize_async().await?;
        assert_eq!(x.to_host(&context).wait_async().await?, vec![3.0, 6.0, 9.0, 12.0]);
        Ok(())
    }

    #[test]
    fn test_record_on_stopped_stream() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build()?;
        let (sender, receiver) = flume::unbounded();
        drop(receiver);
        let stopped = Context {
            inner: Arc::new(ContextInner {
                id: ContextId(uid::Id::new()),
                backend: cpu.clone(),
                sender,
            }),
        };

        let event = stopped.record_event();
        assert_eq!(event.state(), EventState::Poisoned);
        assert_eq!(event.wait(), EventState::Poisoned);

        let consumer = Context::new(&cpu)?;
        consumer.wait_event(&event);
        match consumer.synchronize() {
            Err(DeviceError::Poisoned { context, upstream }) => {
                assert_eq!(context, consumer.id());
                assert_eq!(upstream, stopped.id());
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(stopped.synchronize(), Err(DeviceError::Disconnected(stopped.id())));
        Ok(())
    }
}
