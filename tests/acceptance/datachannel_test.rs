//! DataChannel acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - `DataWritten -> DataChannelFree`: one payload write, no problem event
//! - Repeated `InvalidDataReceived`: `max_retries + 1` writes, then one problem event
//! - `InvalidDataReceivedError`: one write, then one problem event
//! - Messages m1..m5 are written in enqueue order
//! - PLC-originated records are delivered and acknowledged

use super::common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tagcomm_codec::{CodecError, CodecResult};
use tagcomm_common::{ChannelState, DataState, TagError};
use tagcomm_runtime::{
    ChannelRecord, DataChannelListener, DataChannelWriter, MessageOutcome, RawRecord, TagListener,
};

struct WriterFixture {
    endpoint: Endpoint,
    writer: DataChannelWriter<RawRecord>,
    outcomes: Arc<Mutex<Vec<MessageOutcome>>>,
    problems: Arc<Mutex<Vec<tagcomm_runtime::CommunicationProblem>>>,
}

fn writer_fixture() -> WriterFixture {
    let endpoint = Endpoint::new();
    let payload = endpoint.mailbox();
    let listener: Arc<dyn TagListener> = endpoint.polling_listener();
    let writer =
        DataChannelWriter::new(payload, endpoint.controller(), listener, fast_channel()).unwrap();

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    writer
        .events()
        .completed
        .subscribe(move |o| sink.lock().push(o.clone()));
    let (problems, sink) = problem_sink();
    writer.events().communication_problem.subscribe(sink);

    WriterFixture {
        endpoint,
        writer,
        outcomes,
        problems,
    }
}

#[test]
fn test_acknowledged_message_is_written_once() {
    let f = writer_fixture();
    f.endpoint.answer(DataState::DataChannelFree);

    f.writer.send(&record(7)).unwrap();
    assert!(f.writer.wait_write_complete_timeout(Duration::from_secs(5)));

    assert_eq!(f.endpoint.written_sequences(), vec![7]);
    assert!(f.problems.lock().is_empty());
    assert_eq!(f.outcomes.lock()[0].state, ChannelState::Success);
}

#[test]
fn test_rejected_message_is_retried_then_reported() {
    let f = writer_fixture();
    f.endpoint.answer(DataState::InvalidDataReceived);

    f.writer.send(&record(1)).unwrap();
    assert!(f.writer.wait_write_complete_timeout(Duration::from_secs(5)));

    assert_eq!(f.endpoint.written_sequences().len(), 6);
    assert_eq!(f.problems.lock().len(), 1);
    assert_eq!(f.outcomes.lock()[0].attempts, 6);

    // The channel keeps working after giving up on a message
    f.endpoint.answer(DataState::DataChannelFree);
    f.writer.send(&record(2)).unwrap();
    assert!(f.writer.wait_write_complete_timeout(Duration::from_secs(5)));
    assert_eq!(f.outcomes.lock()[1].state, ChannelState::Success);
    assert_eq!(f.problems.lock().len(), 1);
}

#[test]
fn test_fatal_rejection_is_not_retried() {
    let f = writer_fixture();
    f.endpoint.answer(DataState::InvalidDataReceivedError);

    f.writer.send(&record(1)).unwrap();
    assert!(f.writer.wait_write_complete_timeout(Duration::from_secs(5)));

    assert_eq!(f.endpoint.written_sequences().len(), 1);
    assert_eq!(f.problems.lock().len(), 1);
    assert_eq!(f.outcomes.lock()[0].state, ChannelState::Fatal);
}

#[test]
fn test_messages_are_written_in_enqueue_order() {
    let f = writer_fixture();
    f.endpoint.answer(DataState::DataChannelFree);

    for seq in 1..=5 {
        f.writer.send(&record(seq)).unwrap();
    }
    assert!(f.writer.wait_write_complete_timeout(Duration::from_secs(5)));

    assert_eq!(f.endpoint.written_sequences(), vec![1, 2, 3, 4, 5]);
    let sequences: Vec<_> = f.outcomes.lock().iter().map(|o| o.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sequences, sorted);
}

/// Record that only accepts even sequence numbers.
#[derive(Debug, Clone, PartialEq)]
struct EvenRecord(u32);

impl ChannelRecord for EvenRecord {
    fn encode(&self) -> Vec<u8> {
        record(self.0).0
    }

    fn decode(data: &[u8]) -> CodecResult<Self> {
        let seq = u32::from_le_bytes(
            data.get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| CodecError::Truncated("mailbox".into()))?,
        );
        if seq % 2 == 0 {
            Ok(Self(seq))
        } else {
            Err(CodecError::TypeMismatch {
                expected: "even sequence".into(),
                actual: seq.to_string(),
            })
        }
    }
}

fn plc_sends(endpoint: &Endpoint, seq: u32) {
    let mut bytes = seq.to_le_bytes().to_vec();
    bytes.extend_from_slice(&DataState::DataWritten.value().to_le_bytes());
    endpoint.plc.set_bytes(MAILBOX, &bytes).unwrap();
}

fn handshake(endpoint: &Endpoint) -> i16 {
    let raw = endpoint.plc.bytes(HANDSHAKE).unwrap();
    i16::from_le_bytes([raw[0], raw[1]])
}

#[test]
fn test_plc_record_is_delivered_and_acknowledged() {
    let endpoint = Endpoint::new();
    let payload = endpoint.mailbox();
    let listener = endpoint.polling_listener();
    let channel: DataChannelListener<EvenRecord> = DataChannelListener::new(
        payload,
        endpoint.controller(),
        listener.clone(),
        fast_channel(),
    )
    .unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    channel
        .events()
        .received
        .subscribe(move |r: &EvenRecord| sink.lock().push(r.clone()));
    listener.start().unwrap();

    plc_sends(&endpoint, 4);
    assert!(wait_for(|| handshake(&endpoint) == DataState::DataChannelFree.value()));
    assert_eq!(*received.lock(), vec![EvenRecord(4)]);

    plc_sends(&endpoint, 5);
    assert!(wait_for(|| handshake(&endpoint) == DataState::InvalidDataReceived.value()));
    assert_eq!(received.lock().len(), 1);
    listener.stop();
}

#[test]
fn test_channel_setup_rejects_plain_tags() {
    let endpoint = Endpoint::new();
    endpoint.plc.define_symbol("GVL.plain", 4);
    let plain = endpoint
        .access
        .arena()
        .create_tag(tagcomm_runtime::TagSpec::new("GVL", "plain", "DINT"))
        .unwrap();
    let listener: Arc<dyn TagListener> = endpoint.polling_listener();

    let err = DataChannelWriter::<RawRecord>::new(plain, endpoint.controller(), listener, fast_channel())
        .err()
        .unwrap();
    assert!(matches!(err, TagError::InvalidTagDefinition { .. }));
}
