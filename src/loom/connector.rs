//! A produced value shared by many consumers, with their gradients summed.
//!
//! A [`Connector`] wraps the output of a producer block. Consumers register a
//! [`Usage`] per (forward, backward) stream pair while the graph is built; the
//! first [`Connector::fprop`] closes the set. Each pass, the producer's event
//! gates every consumer stream that reads the value, and the consumers'
//! gradient contributions are chained through events into one accumulator that
//! the producer's backward stream waits on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use derive_more::{Deref, Display};
use rustc_hash::FxHashSet as HashSet;
use thiserror::Error;

use super::{
    context::{Context, ContextId, Event},
    device::{Backend, DeviceError, DeviceId},
    ops::TensorOp,
    tensor::Tensor,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
#[display("{}", _0.get())]
pub struct ConnectorId(uid::Id<ConnectorId>);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphProtocolError {
    #[error("connector {connector}: usage registered after the first forward pass")]
    LateRegistration { connector: ConnectorId },
    #[error("connector {connector}: expected {expected} gradient contributions, received {received}")]
    MissingContribution {
        connector: ConnectorId,
        expected: usize,
        received: usize,
    },
    #[error("connector {connector}: usage {usage} contributed twice in one backward pass")]
    DoubleContribution { connector: ConnectorId, usage: usize },
    #[error("connector {connector}: backward pass before any forward pass")]
    NoForwardPass { connector: ConnectorId },
    #[error("connector {connector}: stream {context} runs on device {found}, expected device {expected}")]
    ForeignDevice {
        connector: ConnectorId,
        context: ContextId,
        expected: DeviceId,
        found: DeviceId,
    },
}

#[derive(Debug)]
struct Slot<B: Backend> {
    backward: Context<B>,
    /// Private gradient of the usage, written by the consumer on its backward stream.
    gradient: Tensor<B>,
    contributed: bool,
}

#[derive(Debug)]
struct State<B: Backend> {
    /// Set by the first forward pass; no usage can be added afterwards.
    frozen: bool,
    /// Number of forward passes so far.
    pass: usize,
    /// Forward streams of every usage, gradient-contributing or not.
    readers: Vec<Context<B>>,
    usages: Vec<Slot<B>>,
    /// Contributions received in the current backward pass.
    received: usize,
    /// Event recorded after the latest contribution.
    last: Option<Event>,
}

#[derive(Debug)]
struct Shared<B: Backend> {
    id: ConnectorId,
    value: Tensor<B>,
    /// Sum of the contributions when more than one usage contributes.
    gradient: Tensor<B>,
    forward: Context<B>,
    backward: Context<B>,
    state: Mutex<State<B>>,
}

/// The synchronization-aware wrapper around one produced tensor and its gradient.
#[derive(Debug)]
pub struct Connector<B: Backend> {
    inner: Arc<Shared<B>>,
}

impl<B: Backend> Clone for Connector<B> {
    fn clone(&self) -> Self {
        let inner = self.inner.clone();
        Self { inner }
    }
}

#[derive(Debug)]
pub struct ConnectorBuilder<B: Backend> {
    value: Tensor<B>,
    forward: Option<Context<B>>,
    backward: Option<Context<B>>,
}

impl<B: Backend> ConnectorBuilder<B> {
    /// The stream the producer writes the value on.
    pub fn forward_context(mut self, context: Context<B>) -> Self {
        self.forward = Some(context);
        self
    }

    /// The stream the producer reads the gradient on. Defaults to the forward stream.
    pub fn backward_context(mut self, context: Context<B>) -> Self {
        self.backward = Some(context);
        self
    }

    pub fn build(self) -> Result<Connector<B>, DeviceError> {
        let Self {
            value,
            forward,
            backward,
        } = self;
        let forward = match forward {
            Some(context) => context,
            None => Context::new(value.backend())?,
        };
        let backward = backward.unwrap_or_else(|| forward.clone());

        let id = ConnectorId(uid::Id::new());
        let gradient = value.zeros_like();
        let state = Mutex::new(State {
            frozen: false,
            pass: 0,
            readers: vec![],
            usages: vec![],
            received: 0,
            last: None,
        });
        log::debug!("created connector {id} of shape {}", value.shape());

        let inner = Arc::new(Shared {
            id,
            value,
            gradient,
            forward,
            backward,
            state,
        });
        Ok(Connector { inner })
    }
}

impl<B: Backend> Connector<B> {
    /// Wraps `value` with a fresh producer stream used for both passes.
    pub fn new(value: Tensor<B>) -> Result<Self, DeviceError> {
        Self::builder(value).build()
    }

    pub fn builder(value: Tensor<B>) -> ConnectorBuilder<B> {
        ConnectorBuilder {
            value,
            forward: None,
            backward: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectorId {
        self.inner.id
    }

    /// The produced tensor. Only the producer writes it, on [`Connector::forward_context`].
    #[inline]
    pub fn value(&self) -> &Tensor<B> {
        &self.inner.value
    }

    #[inline]
    pub fn forward_context(&self) -> &Context<B> {
        &self.inner.forward
    }

    #[inline]
    pub fn backward_context(&self) -> &Context<B> {
        &self.inner.backward
    }

    /// Number of gradient-contributing usages.
    pub fn num_usages(&self) -> usize {
        self.state().usages.len()
    }

    fn state(&self) -> MutexGuard<'_, State<B>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_context(&self, context: &Context<B>) -> Result<(), GraphProtocolError> {
        let expected = self.inner.value.backend().id();
        let found = context.backend().id();
        match expected == found {
            true => Ok(()),
            false => Err(GraphProtocolError::ForeignDevice {
                connector: self.id(),
                context: context.id(),
                expected,
                found,
            }),
        }
    }

    fn register(&self, state: &mut State<B>, forward: &Context<B>) -> Result<(), GraphProtocolError> {
        if state.frozen {
            log::error!("connector {}: late registration on stream {}", self.id(), forward.id());
            return Err(GraphProtocolError::LateRegistration {
                connector: self.id(),
            });
        }
        self.check_context(forward)?;
        state.readers.push(forward.clone());
        Ok(())
    }

    /// Declares a consumer that reads the value on `forward` and contributes a gradient on `backward`.
    pub fn register_usage(
        &self,
        forward: Context<B>,
        backward: Context<B>,
    ) -> Result<Usage<B>, GraphProtocolError> {
        self.check_context(&backward)?;
        let mut state = self.state();
        self.register(&mut state, &forward)?;

        let index = state.usages.len();
        let gradient = self.inner.value.zeros_like();
        state.usages.push(Slot {
            backward: backward.clone(),
            gradient: gradient.clone(),
            contributed: false,
        });
        log::trace!(
            "connector {}: usage {index} on streams {} / {}",
            self.id(),
            forward.id(),
            backward.id()
        );

        Ok(Usage {
            connector: self.clone(),
            index,
            forward,
            backward,
            gradient,
        })
    }

    /// Declares a consumer that reads the value on `forward` and never contributes a gradient.
    pub fn register_forward_usage(&self, forward: Context<B>) -> Result<Tensor<B>, GraphProtocolError> {
        let mut state = self.state();
        self.register(&mut state, &forward)?;
        Ok(self.inner.value.clone())
    }

    /// Publishes the value written so far on the forward stream to every reader stream.
    ///
    /// Called by the producer once per forward pass, after enqueuing its writes.
    /// Fails if the previous backward pass was started but not finished.
    pub fn fprop(&self) -> Result<(), GraphProtocolError> {
        let mut state = self.state();

        let expected = state.usages.len();
        let received = state.received;
        let torn = received > 0 && received < expected;

        state.frozen = true;
        state.pass += 1;
        state.received = 0;
        state.last = None;
        state.usages.iter_mut().for_each(|slot| slot.contributed = false);

        if torn {
            log::error!(
                "connector {}: forward pass over a torn backward pass ({received} of {expected})",
                self.id()
            );
            return Err(GraphProtocolError::MissingContribution {
                connector: self.id(),
                expected,
                received,
            });
        }

        let forward = &self.inner.forward;
        let event = forward.record_event();
        let mut waited = HashSet::default();
        waited.insert(forward.id());
        for reader in &state.readers {
            if waited.insert(reader.id()) {
                reader.wait_event(&event);
            }
        }
        Ok(())
    }

    /// The gradient of the value for the current pass, visible on [`Connector::backward_context`].
    ///
    /// Zero when nothing contributes a gradient; the single usage's own gradient
    /// when exactly one does. Fails unless every usage has contributed.
    pub fn bprop(&self) -> Result<Tensor<B>, GraphProtocolError> {
        let state = self.state();
        if state.pass == 0 {
            return Err(GraphProtocolError::NoForwardPass {
                connector: self.id(),
            });
        }

        let expected = state.usages.len();
        if state.received < expected {
            log::error!(
                "connector {}: gradient read with {} of {expected} contributions",
                self.id(),
                state.received
            );
            return Err(GraphProtocolError::MissingContribution {
                connector: self.id(),
                expected,
                received: state.received,
            });
        }

        match state.usages.as_slice() {
            [] => {
                let gradient = &self.inner.gradient;
                self.inner.backward.enqueue(TensorOp::Fill {
                    len: gradient.len(),
                    value: 0.0,
                    output: gradient.buffer().clone(),
                });
                Ok(gradient.clone())
            }
            [slot] => Ok(slot.gradient.clone()),
            _ => Ok(self.inner.gradient.clone()),
        }
    }
}

/// One consumer's registration on a [`Connector`].
#[derive(Debug, Clone)]
pub struct Usage<B: Backend> {
    connector: Connector<B>,
    index: usize,
    forward: Context<B>,
    backward: Context<B>,
    gradient: Tensor<B>,
}

impl<B: Backend> Usage<B> {
    /// The value, to be read on [`Usage::forward_context`] after the producer's `fprop`.
    #[inline]
    pub fn value(&self) -> &Tensor<B> {
        self.connector.value()
    }

    /// The private gradient of this usage, to be written on [`Usage::backward_context`].
    #[inline]
    pub fn gradient(&self) -> &Tensor<B> {
        &self.gradient
    }

    #[inline]
    pub fn forward_context(&self) -> &Context<B> {
        &self.forward
    }

    #[inline]
    pub fn backward_context(&self) -> &Context<B> {
        &self.backward
    }

    #[inline]
    pub fn connector(&self) -> &Connector<B> {
        &self.connector
    }

    /// Position of the usage in registration order.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hands in this usage's gradient for the current pass.
    ///
    /// Called once per backward pass, after enqueuing the writes to [`Usage::gradient`].
    pub fn bprop(&self) -> Result<(), GraphProtocolError> {
        let connector = &self.connector;
        let shared = &connector.inner;
        let mut state = connector.state();

        if state.pass == 0 {
            return Err(GraphProtocolError::NoForwardPass {
                connector: connector.id(),
            });
        }
        if state.usages[self.index].contributed {
            log::error!("connector {}: usage {} contributed twice", connector.id(), self.index);
            return Err(GraphProtocolError::DoubleContribution {
                connector: connector.id(),
                usage: self.index,
            });
        }
        state.usages[self.index].contributed = true;
        state.received += 1;

        let expected = state.usages.len();
        let context = &self.backward;
        if expected > 1 {
            // contributions are chained so that only one stream writes the sum at a time
            if let Some(last) = &state.last {
                context.wait_event(last);
            }
            let len = self.gradient.len();
            let input = self.gradient.buffer().clone();
            let output = shared.gradient.buffer().clone();
            let op = match state.received {
                1 => TensorOp::Copy { len, input, output },
                _ => TensorOp::Axpby {
                    len,
                    alpha: 1.0,
                    input,
                    beta: 1.0,
                    output,
                },
            };
            context.enqueue(op);
        }

        let event = context.record_event();
        if state.received == expected {
            shared.backward.wait_event(&event);
        }
        state.last = Some(event);
        Ok(())
    }
}
