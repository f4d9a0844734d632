//! Host → PLC direction of a DataChannel.
//!
//! Messages are queued and delivered one at a time by a single worker. Each
//! delivery runs through [`ChannelStateMachine`]:
//!
//! ```text
//! IDLE → SENDING → AWAITING_HANDSHAKE → SUCCESS
//!                      │    ▲         → FATAL
//!                      ▼    │
//!                      RETRY ┘ (InvalidDataReceived, bounded)
//! ```
//!
//! Failures never surface to the caller; they end the current message and
//! are published on [`WriterEvents::communication_problem`].

use super::{set_data_state, validate_channel, ChannelBinding, ChannelRecord};
use crate::controller::TagController;
use crate::events::{CommunicationProblem, EventHub, ProblemSource};
use crate::listener::TagListener;
use crate::tag::TagId;
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tagcomm_codec::TagValue;
use tagcomm_common::{
    ChannelState, ChannelStateMachine, DataChannelConfig, DataState, TagError, TagResult,
};
use tracing::{debug, error, info, warn};

/// What a queued request does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Payload transfer.
    Message,
    /// `ClearFifoBuffer` request.
    ClearFifo,
}

/// Final state of one queued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageOutcome {
    /// Sequence number returned when the request was queued.
    pub sequence: u64,
    /// Request kind.
    pub kind: MessageKind,
    /// [`ChannelState::Success`] or [`ChannelState::Fatal`].
    pub state: ChannelState,
    /// Send attempts made.
    pub attempts: u32,
    /// Failure description.
    pub reason: Option<String>,
}

/// Event hubs of a [`DataChannelWriter`].
#[derive(Debug, Default)]
pub struct WriterEvents {
    /// One event per finished request.
    pub completed: EventHub<MessageOutcome>,
    /// Abandoned requests.
    pub communication_problem: EventHub<CommunicationProblem>,
}

enum Request {
    Send { sequence: u64, record: Vec<u8> },
    ClearFifo { sequence: u64 },
}

impl Request {
    fn sequence(&self) -> u64 {
        match self {
            Self::Send { sequence, .. } | Self::ClearFifo { sequence } => *sequence,
        }
    }

    fn kind(&self) -> MessageKind {
        match self {
            Self::Send { .. } => MessageKind::Message,
            Self::ClearFifo { .. } => MessageKind::ClearFifo,
        }
    }

    /// Handshake value written with each attempt.
    fn marker(&self) -> DataState {
        match self {
            Self::Send { .. } => DataState::DataWritten,
            Self::ClearFifo { .. } => DataState::ClearFifoBuffer,
        }
    }
}

struct Shared {
    binding: ChannelBinding,
    controller: Arc<TagController>,
    listener: Arc<dyn TagListener>,
    config: DataChannelConfig,
    pending: Mutex<usize>,
    drained: Condvar,
    events: WriterEvents,
}

/// Sends records to the PLC over one channel, strictly in queue order.
pub struct DataChannelWriter<R: ChannelRecord> {
    shared: Arc<Shared>,
    next_sequence: AtomicU64,
    sender: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    _record: PhantomData<fn(&R)>,
}

impl<R: ChannelRecord> std::fmt::Debug for DataChannelWriter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelWriter")
            .field("channel", &self.shared.binding.path)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl<R: ChannelRecord> DataChannelWriter<R> {
    /// Bind a writer to `payload` and start its worker.
    ///
    /// # Errors
    ///
    /// [`TagError::InvalidTagDefinition`] if the payload breaks the channel
    /// contract, [`TagError::Config`] if the worker cannot be spawned.
    pub fn new(
        payload: TagId,
        controller: Arc<TagController>,
        listener: Arc<dyn TagListener>,
        config: DataChannelConfig,
    ) -> TagResult<Self> {
        let binding = validate_channel(listener.core().access(), payload)?;
        let path = binding.path.clone();
        let shared = Arc::new(Shared {
            binding,
            controller,
            listener,
            config,
            pending: Mutex::new(0),
            drained: Condvar::new(),
            events: WriterEvents::default(),
        });

        let (sender, receiver) = channel::unbounded::<Request>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("tagcomm-dcw-{}", payload.index()))
            .spawn(move || {
                for request in receiver {
                    let outcome = worker_shared.deliver(&request);
                    worker_shared.events.completed.emit(&outcome);
                    worker_shared.finish_one();
                }
            })
            .map_err(|e| TagError::Config(format!("Failed to spawn channel writer: {e}")))?;

        info!(channel = %path, "DataChannel writer started");
        Ok(Self {
            shared,
            next_sequence: AtomicU64::new(1),
            sender: Some(sender),
            worker: Some(worker),
            _record: PhantomData,
        })
    }

    /// Channel tags.
    #[must_use]
    pub fn binding(&self) -> &ChannelBinding {
        &self.shared.binding
    }

    /// Event hubs.
    #[must_use]
    pub fn events(&self) -> &WriterEvents {
        &self.shared.events
    }

    fn enqueue(&self, build: impl FnOnce(u64) -> Request) -> TagResult<u64> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| TagError::Config("channel writer stopped".into()))?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        *self.shared.pending.lock() += 1;
        if sender.send(build(sequence)).is_err() {
            self.shared.finish_one();
            return Err(TagError::Config("channel writer stopped".into()));
        }
        Ok(sequence)
    }

    /// Queue a record. Returns its sequence number.
    ///
    /// # Errors
    ///
    /// [`TagError::TypeMismatch`] when the encoded record does not match the
    /// payload size; [`TagError::Config`] after [`Self::stop`].
    pub fn send(&self, record: &R) -> TagResult<u64> {
        let bytes = record.encode();
        let binding = &self.shared.binding;
        if bytes.len() != binding.byte_len {
            return Err(TagError::TypeMismatch {
                tag: binding.path.clone(),
                expected: format!("{} byte record", binding.byte_len),
                actual: format!("{} byte record", bytes.len()),
            });
        }
        self.enqueue(|sequence| Request::Send {
            sequence,
            record: bytes,
        })
    }

    /// Queue a `ClearFifoBuffer` request.
    ///
    /// # Errors
    ///
    /// [`TagError::Config`] after [`Self::stop`].
    pub fn clear_fifo(&self) -> TagResult<u64> {
        self.enqueue(|sequence| Request::ClearFifo { sequence })
    }

    /// Requests queued or in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    /// Block until every queued request has finished.
    pub fn wait_write_complete(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.drained.wait(&mut pending);
        }
    }

    /// Like [`Self::wait_write_complete`] with an upper bound. Returns false
    /// if requests are still pending when it elapses.
    pub fn wait_write_complete_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self
                .shared
                .drained
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return *pending == 0;
            }
        }
        true
    }

    /// Finish queued requests and stop the worker.
    pub fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            drop(sender);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
            info!(channel = %self.shared.binding.path, "DataChannel writer stopped");
        }
    }
}

impl<R: ChannelRecord> Drop for DataChannelWriter<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How one handshake wait ended.
enum Answer {
    Free,
    Invalid,
    InvalidError,
}

impl Shared {
    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn deliver(&self, request: &Request) -> MessageOutcome {
        let mut machine = ChannelStateMachine::new();
        let mut attempts = 0u32;
        let mut retries = 0u32;

        let result: Result<(), String> = loop {
            if let Err(e) = machine.transition(ChannelState::Sending) {
                break Err(e.to_string());
            }
            attempts += 1;
            debug!(
                channel = %self.binding.path,
                sequence = request.sequence(),
                attempt = attempts,
                "Sending"
            );
            if let Err(e) = self.send_attempt(request) {
                machine.fail();
                break Err(e.to_string());
            }

            if let Err(e) = machine.transition(ChannelState::AwaitingHandshake) {
                break Err(e.to_string());
            }
            match self.await_handshake(request.marker()) {
                Ok(Answer::Free) => {
                    let _ = machine.transition(ChannelState::Success);
                    break Ok(());
                }
                Ok(Answer::Invalid) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        machine.fail();
                        break Err(format!("invalid data after {attempts} tries"));
                    }
                    warn!(
                        channel = %self.binding.path,
                        sequence = request.sequence(),
                        retries,
                        "PLC rejected payload, resending"
                    );
                    let _ = machine.transition(ChannelState::Retry);
                }
                Ok(Answer::InvalidError) => {
                    machine.fail();
                    break Err("PLC reported invalid data error".to_string());
                }
                Err(e) => {
                    machine.fail();
                    break Err(e.to_string());
                }
            }
        };

        let state = machine.state();
        match result {
            Ok(()) => {
                debug!(channel = %self.binding.path, sequence = request.sequence(), attempts, "Delivered");
                MessageOutcome {
                    sequence: request.sequence(),
                    kind: request.kind(),
                    state,
                    attempts,
                    reason: None,
                }
            }
            Err(reason) => {
                error!(
                    channel = %self.binding.path,
                    sequence = request.sequence(),
                    attempts,
                    %reason,
                    "Message abandoned"
                );
                self.events.communication_problem.emit(&CommunicationProblem {
                    source: ProblemSource::DataChannelWriter,
                    reason: reason.clone(),
                    tag: Some(self.binding.path.clone()),
                    error: None,
                    fatal: false,
                });
                MessageOutcome {
                    sequence: request.sequence(),
                    kind: request.kind(),
                    state: ChannelState::Fatal,
                    attempts,
                    reason: Some(reason),
                }
            }
        }
    }

    fn send_attempt(&self, request: &Request) -> TagResult<()> {
        let timeout = self.config.write_timeout;
        if let Request::Send { record, .. } = request {
            let mut data = record.clone();
            set_data_state(&mut data, DataState::DataWritten);
            let payload = TagValue::Blob {
                type_name: self.binding.type_name.clone(),
                data,
            };
            self.controller
                .write(self.binding.payload, payload)?
                .wait_timeout(timeout)?;
        }
        self.controller
            .write(self.binding.handshake, TagValue::I16(request.marker().value()))?
            .wait_timeout(timeout)?;
        Ok(())
    }

    /// Poll the handshake until the PLC answers or the attempt times out.
    fn await_handshake(&self, marker: DataState) -> TagResult<Answer> {
        let started = Instant::now();
        loop {
            let value = self
                .listener
                .read_one_synchronously(self.binding.handshake)?;
            let raw = value
                .as_ref()
                .and_then(TagValue::as_i64)
                .and_then(|v| i16::try_from(v).ok())
                .ok_or_else(|| TagError::TypeMismatch {
                    tag: self.binding.path.clone(),
                    expected: "INT handshake".to_string(),
                    actual: value
                        .as_ref()
                        .map_or_else(|| "no value".to_string(), |v| v.kind().to_string()),
                })?;

            match DataState::from_value(raw) {
                Some(DataState::DataChannelFree) => return Ok(Answer::Free),
                Some(DataState::InvalidDataReceived) => return Ok(Answer::Invalid),
                Some(DataState::InvalidDataReceivedError) => return Ok(Answer::InvalidError),
                Some(state) if state == marker => {}
                _ => {
                    return Err(TagError::ProtocolViolation {
                        channel: self.binding.path.clone(),
                        value: raw,
                    })
                }
            }

            if started.elapsed() > self.config.timeout {
                return Err(TagError::Timeout(format!(
                    "no handshake answer on {} within {:?}",
                    self.binding.path, self.config.timeout
                )));
            }
            thread::sleep(self.config.polling_rate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::TagAccess;
    use crate::datachannel::RawRecord;
    use crate::listener::PollingTagListener;
    use crate::tag::{TagArena, TagSpec};
    use tagcomm_codec::ValueCodec;
    use tagcomm_common::{PollingConfig, TransportError};
    use tagcomm_transport::SimulatedPlc;

    const HANDSHAKE: &str = "GVL.toPlc.DataState";

    struct Fixture {
        plc: Arc<SimulatedPlc>,
        writer: DataChannelWriter<RawRecord>,
    }

    fn fixture(config: DataChannelConfig) -> Fixture {
        let plc = Arc::new(SimulatedPlc::default());
        plc.define_struct("GVL.toPlc", &[("id", 4), ("DataState", 2)]);
        let access = Arc::new(TagAccess::new(
            Arc::new(TagArena::new()),
            plc.clone(),
            Arc::new(ValueCodec::new()),
        ));
        let payload = access
            .arena()
            .create_tag(TagSpec::new("GVL", "toPlc", "ST_ToPlc"))
            .unwrap();
        access.arena().add_child(payload, "id", "DINT").unwrap();
        access.arena().add_child(payload, "DataState", "INT").unwrap();

        let controller = Arc::new(TagController::new(access.clone()).unwrap());
        let listener: Arc<dyn TagListener> =
            Arc::new(PollingTagListener::new(access, PollingConfig::default()));
        let writer = DataChannelWriter::new(payload, controller, listener, config).unwrap();
        Fixture { plc, writer }
    }

    fn fast() -> DataChannelConfig {
        DataChannelConfig {
            polling_rate: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
            max_retries: 5,
            write_timeout: Duration::from_secs(1),
        }
    }

    fn answer(plc: &SimulatedPlc, state: DataState) {
        plc.on_write(
            HANDSHAKE,
            Arc::new(move |_: &[u8]| Some(state.value().to_le_bytes().to_vec())),
        );
    }

    fn record(id: i32) -> RawRecord {
        let mut bytes = id.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0]);
        RawRecord(bytes)
    }

    fn outcomes(writer: &DataChannelWriter<RawRecord>) -> Arc<Mutex<Vec<MessageOutcome>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        writer
            .events()
            .completed
            .subscribe(move |o| sink.lock().push(o.clone()));
        seen
    }

    #[test]
    fn test_success_writes_payload_once() {
        let f = fixture(fast());
        answer(&f.plc, DataState::DataChannelFree);
        let seen = outcomes(&f.writer);

        f.writer.send(&record(42)).unwrap();
        assert!(f.writer.wait_write_complete_timeout(Duration::from_secs(2)));

        let payloads = f.plc.writes_to("GVL.toPlc");
        assert_eq!(payloads.len(), 1);
        assert_eq!(&payloads[0][..4], &42i32.to_le_bytes());
        assert_eq!(data_state(&payloads[0]), 1);
        assert_eq!(f.plc.writes_to(HANDSHAKE), vec![1i16.to_le_bytes().to_vec()]);
        let seen = seen.lock();
        assert_eq!(seen[0].state, ChannelState::Success);
        assert_eq!(seen[0].attempts, 1);
    }

    fn data_state(record: &[u8]) -> i16 {
        crate::datachannel::data_state_of(record).unwrap()
    }

    #[test]
    fn test_invalid_data_retries_then_gives_up() {
        let f = fixture(fast());
        answer(&f.plc, DataState::InvalidDataReceived);
        let problems = Arc::new(Mutex::new(Vec::new()));
        let sink = problems.clone();
        f.writer
            .events()
            .communication_problem
            .subscribe(move |p| sink.lock().push(p.reason.clone()));

        f.writer.send(&record(1)).unwrap();
        f.writer.wait_write_complete();
        assert_eq!(f.plc.writes_to("GVL.toPlc").len(), 6);
        assert_eq!(*problems.lock(), vec!["invalid data after 6 tries".to_string()]);
    }

    #[test]
    fn test_invalid_data_error_is_immediate() {
        let f = fixture(fast());
        answer(&f.plc, DataState::InvalidDataReceivedError);
        let seen = outcomes(&f.writer);
        f.writer.send(&record(1)).unwrap();
        f.writer.wait_write_complete();
        assert_eq!(f.plc.writes_to("GVL.toPlc").len(), 1);
        assert_eq!(seen.lock()[0].state, ChannelState::Fatal);
    }

    #[test]
    fn test_timeout_moves_to_next_message() {
        let f = fixture(DataChannelConfig {
            timeout: Duration::from_millis(20),
            ..fast()
        });
        let seen = outcomes(&f.writer);
        // No answer: the handshake stays at DataWritten
        f.writer.send(&record(1)).unwrap();
        f.writer.wait_write_complete();
        answer(&f.plc, DataState::DataChannelFree);
        f.writer.send(&record(2)).unwrap();
        f.writer.wait_write_complete();

        let seen = seen.lock();
        assert_eq!(seen[0].state, ChannelState::Fatal);
        assert!(seen[0].reason.as_deref().unwrap().contains("timeout"));
        assert_eq!(seen[1].state, ChannelState::Success);
    }

    #[test]
    fn test_unexpected_handshake_is_protocol_violation() {
        let f = fixture(fast());
        f.plc.on_write(HANDSHAKE, Arc::new(|_: &[u8]| Some(7i16.to_le_bytes().to_vec())));
        let seen = outcomes(&f.writer);
        f.writer.send(&record(1)).unwrap();
        f.writer.wait_write_complete();
        let reason = seen.lock()[0].reason.clone().unwrap();
        assert!(reason.contains("unexpected handshake value 7"));
    }

    #[test]
    fn test_write_failure_is_reported() {
        let f = fixture(fast());
        f.plc
            .inject_write_fault(Some("GVL.toPlc"), TransportError::Timeout, 2);
        let seen = outcomes(&f.writer);
        f.writer.send(&record(1)).unwrap();
        f.writer.wait_write_complete();
        assert_eq!(seen.lock()[0].state, ChannelState::Fatal);
        assert!(f.plc.writes_to(HANDSHAKE).is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let f = fixture(fast());
        answer(&f.plc, DataState::DataChannelFree);
        for id in 1..=5 {
            f.writer.send(&record(id)).unwrap();
        }
        f.writer.wait_write_complete();
        let ids: Vec<i32> = f
            .plc
            .writes_to("GVL.toPlc")
            .iter()
            .map(|w| i32::from_le_bytes(w[..4].try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_clear_fifo_request() {
        let f = fixture(fast());
        answer(&f.plc, DataState::DataChannelFree);
        let seen = outcomes(&f.writer);
        f.writer.clear_fifo().unwrap();
        f.writer.wait_write_complete();
        assert!(f.plc.writes_to("GVL.toPlc").is_empty());
        assert_eq!(f.plc.writes_to(HANDSHAKE), vec![(-98i16).to_le_bytes().to_vec()]);
        assert_eq!(seen.lock()[0].kind, MessageKind::ClearFifo);
    }

    #[test]
    fn test_wrong_record_size_rejected() {
        let f = fixture(fast());
        let err = f.writer.send(&RawRecord(vec![0; 3])).unwrap_err();
        assert!(matches!(err, TagError::TypeMismatch { .. }));
        assert_eq!(f.writer.pending(), 0);
    }
}
