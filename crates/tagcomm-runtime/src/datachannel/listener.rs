//! PLC → host direction of a DataChannel.

use super::{validate_channel, ChannelBinding, ChannelRecord};
use crate::controller::TagController;
use crate::events::{CommunicationProblem, EventHub, ProblemSource, SubscriptionId, TagChanged};
use crate::listener::TagListener;
use crate::tag::TagId;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tagcomm_codec::TagValue;
use tagcomm_common::{DataChannelConfig, DataState, TagError, TagResult};
use tracing::{debug, info, warn};

/// Event hubs of a [`DataChannelListener`].
#[derive(Debug)]
pub struct DataChannelEvents<R> {
    /// Decoded records, in arrival order.
    pub received: EventHub<R>,
    /// The PLC asked to drop queued payloads.
    pub fifo_cleared: EventHub<()>,
    /// Rejected or unreadable payloads.
    pub communication_problem: EventHub<CommunicationProblem>,
}

impl<R> Default for DataChannelEvents<R> {
    fn default() -> Self {
        Self {
            received: EventHub::new(),
            fifo_cleared: EventHub::new(),
            communication_problem: EventHub::new(),
        }
    }
}

struct Shared<R> {
    binding: ChannelBinding,
    /// Handshake id as tracked by the listener (may be a deduplicated twin).
    handshake: TagId,
    listener: Arc<dyn TagListener>,
    controller: Arc<TagController>,
    config: DataChannelConfig,
    rejected: AtomicU32,
    events: DataChannelEvents<R>,
    _record: PhantomData<fn() -> R>,
}

/// Receives records the PLC publishes on a channel.
///
/// Reacts to handshake changes seen by the tag listener: on `DataWritten`
/// it reads and decodes the payload, publishes it and answers
/// `DataChannelFree`. Undecodable payloads are answered with
/// `InvalidDataReceived` until the retry budget is spent, then with
/// `InvalidDataReceivedError`.
pub struct DataChannelListener<R: ChannelRecord> {
    shared: Arc<Shared<R>>,
    subscription: SubscriptionId,
}

impl<R: ChannelRecord> std::fmt::Debug for DataChannelListener<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelListener")
            .field("channel", &self.shared.binding.path)
            .finish_non_exhaustive()
    }
}

impl<R: ChannelRecord> DataChannelListener<R> {
    /// Bind to `payload` and start tracking its handshake member.
    ///
    /// # Errors
    ///
    /// [`TagError::InvalidTagDefinition`] if the payload breaks the channel
    /// contract, or whatever the tag listener's `add_tag` reports.
    pub fn new(
        payload: TagId,
        controller: Arc<TagController>,
        listener: Arc<dyn TagListener>,
        config: DataChannelConfig,
    ) -> TagResult<Self> {
        let binding = validate_channel(listener.core().access(), payload)?;
        let handshake = listener.add_tag(binding.handshake)?;

        let shared = Arc::new(Shared {
            binding,
            handshake,
            listener: Arc::clone(&listener),
            controller,
            config,
            rejected: AtomicU32::new(0),
            events: DataChannelEvents::default(),
            _record: PhantomData,
        });

        let weak: Weak<Shared<R>> = Arc::downgrade(&shared);
        let subscription = listener.events().tag_changed.subscribe(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_tag_changed(event);
            }
        });

        info!(channel = %shared.binding.path, "DataChannel listener started");
        Ok(Self {
            shared,
            subscription,
        })
    }

    /// Channel tags.
    #[must_use]
    pub fn binding(&self) -> &ChannelBinding {
        &self.shared.binding
    }

    /// Event hubs.
    #[must_use]
    pub fn events(&self) -> &DataChannelEvents<R> {
        &self.shared.events
    }
}

impl<R: ChannelRecord> Drop for DataChannelListener<R> {
    fn drop(&mut self) {
        self.shared
            .listener
            .events()
            .tag_changed
            .unsubscribe(self.subscription);
    }
}

impl<R: ChannelRecord> Shared<R> {
    fn on_tag_changed(&self, event: &TagChanged) {
        if event.tag != self.handshake {
            return;
        }
        let Some(state) = event
            .new
            .as_ref()
            .and_then(TagValue::as_i64)
            .and_then(|v| i16::try_from(v).ok())
            .and_then(DataState::from_value)
        else {
            return;
        };

        match state {
            DataState::DataWritten => self.receive(),
            DataState::ClearFifoBuffer => {
                info!(channel = %self.binding.path, "PLC cleared channel FIFO");
                self.events.fifo_cleared.emit(&());
                self.answer(DataState::DataChannelFree);
            }
            // Our own answers
            _ => {}
        }
    }

    fn receive(&self) {
        let decoded = self
            .listener
            .read_one_synchronously(self.binding.payload)
            .and_then(|value| {
                let bytes = value.as_ref().and_then(TagValue::as_bytes).ok_or_else(|| {
                    TagError::TypeMismatch {
                        tag: self.binding.path.clone(),
                        expected: self.binding.type_name.clone(),
                        actual: value
                            .as_ref()
                            .map_or_else(|| "no value".to_string(), |v| v.kind().to_string()),
                    }
                })?;
                R::decode(bytes).map_err(|e| e.for_tag(&self.binding.path))
            });

        match decoded {
            Ok(record) => {
                self.rejected.store(0, Ordering::Release);
                debug!(channel = %self.binding.path, "Record received");
                self.events.received.emit(&record);
                self.answer(DataState::DataChannelFree);
            }
            Err(e) => {
                let rejected = self.rejected.fetch_add(1, Ordering::AcqRel) + 1;
                let give_up = rejected > self.config.max_retries;
                warn!(
                    channel = %self.binding.path,
                    rejected,
                    error = %e,
                    "Rejected channel payload"
                );
                self.events
                    .communication_problem
                    .emit(&CommunicationProblem::from_error(
                        ProblemSource::DataChannelListener,
                        Some(&self.binding.path),
                        e,
                        give_up,
                    ));
                if give_up {
                    self.rejected.store(0, Ordering::Release);
                    self.answer(DataState::InvalidDataReceivedError);
                } else {
                    self.answer(DataState::InvalidDataReceived);
                }
            }
        }
    }

    fn answer(&self, state: DataState) {
        // Queued only; the PLC side polls the handshake for the answer
        if let Err(e) = self
            .controller
            .write(self.binding.handshake, TagValue::I16(state.value()))
        {
            self.events
                .communication_problem
                .emit(&CommunicationProblem::from_error(
                    ProblemSource::DataChannelListener,
                    Some(&self.binding.path),
                    e,
                    false,
                ));
        }
    }
}
