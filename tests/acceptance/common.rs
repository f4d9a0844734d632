//! Common fixtures for the acceptance scenarios.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tagcomm_codec::ValueCodec;
use tagcomm_common::{DataChannelConfig, DataState, PollingConfig};
use tagcomm_runtime::{
    CommunicationProblem, PollingTagListener, RawRecord, TagAccess, TagArena, TagController,
    TagId, TagSpec,
};
use tagcomm_transport::SimulatedPlc;

/// Struct symbol used as a DataChannel mailbox.
pub const MAILBOX: &str = "GVL.mailbox";
/// Handshake member of [`MAILBOX`].
pub const HANDSHAKE: &str = "GVL.mailbox.DataState";

/// One host-side view of a simulated PLC.
pub struct Endpoint {
    pub plc: Arc<SimulatedPlc>,
    pub access: Arc<TagAccess>,
}

impl Endpoint {
    /// Fresh PLC exposing the mailbox struct.
    pub fn new() -> Self {
        let plc = Arc::new(SimulatedPlc::default());
        plc.define_struct(MAILBOX, &[("seq", 4), ("DataState", 2)]);
        Self::attach(plc)
    }

    /// Another host-side view sharing `plc`.
    pub fn attach(plc: Arc<SimulatedPlc>) -> Self {
        let access = Arc::new(TagAccess::new(
            Arc::new(TagArena::new()),
            plc.clone(),
            Arc::new(ValueCodec::new()),
        ));
        Self { plc, access }
    }

    /// Mailbox payload tag with its `seq` and `DataState` members.
    pub fn mailbox(&self) -> TagId {
        let arena = self.access.arena();
        let payload = arena
            .create_tag(TagSpec::new("GVL", "mailbox", "ST_Mailbox"))
            .unwrap();
        arena.add_child(payload, "seq", "UDINT").unwrap();
        arena.add_child(payload, "DataState", "INT").unwrap();
        payload
    }

    pub fn controller(&self) -> Arc<TagController> {
        Arc::new(TagController::new(self.access.clone()).unwrap())
    }

    pub fn polling_listener(&self) -> Arc<PollingTagListener> {
        Arc::new(PollingTagListener::new(self.access.clone(), fast_polling()))
    }

    /// Answer every handshake write with `state`.
    pub fn answer(&self, state: DataState) {
        self.plc.on_write(
            HANDSHAKE,
            Arc::new(move |_: &[u8]| Some(state.value().to_le_bytes().to_vec())),
        );
    }

    /// Sequence numbers of all payload writes, in order.
    pub fn written_sequences(&self) -> Vec<u32> {
        self.plc
            .writes_to(MAILBOX)
            .iter()
            .map(|w| u32::from_le_bytes(w[..4].try_into().unwrap()))
            .collect()
    }
}

pub fn fast_polling() -> PollingConfig {
    PollingConfig {
        refresh_rate: Duration::from_millis(2),
        reconnect_timeout: Duration::from_secs(5),
        performance_samples: 50,
    }
}

pub fn fast_channel() -> DataChannelConfig {
    DataChannelConfig {
        polling_rate: Duration::from_millis(1),
        timeout: Duration::from_millis(500),
        max_retries: 5,
        write_timeout: Duration::from_secs(1),
    }
}

/// Mailbox record carrying `seq` with a cleared state field.
pub fn record(seq: u32) -> RawRecord {
    let mut bytes = seq.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[0, 0]);
    RawRecord(bytes)
}

/// Collects every problem pushed into the returned vector.
pub fn problem_sink() -> (
    Arc<Mutex<Vec<CommunicationProblem>>>,
    impl Fn(&CommunicationProblem) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |p: &CommunicationProblem| sink.lock().push(p.clone()))
}

/// Poll `condition` for up to three seconds.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}
