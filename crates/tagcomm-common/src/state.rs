//! DataChannel handshake values and per-message state machine.
//!
//! Message lifecycle:
//! IDLE → SENDING → AWAITING_HANDSHAKE → SUCCESS | RETRY | FATAL
//!
//! RETRY loops back to SENDING; SUCCESS and FATAL return to IDLE once the
//! writer picks up the next queued message.

use crate::error::{TagError, TagResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// INT16 status values exchanged through the handshake field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum DataState {
    /// Sender has written a complete payload.
    DataWritten = 1,
    /// Receiver consumed the payload; channel may be reused.
    DataChannelFree = -1,
    /// Request to drop all queued payloads.
    ClearFifoBuffer = -98,
    /// Receiver rejected the payload; sender should resend.
    InvalidDataReceived = -99,
    /// Receiver rejected the payload and gave up.
    InvalidDataReceivedError = -100,
}

impl DataState {
    /// Wire value of this state.
    #[must_use]
    pub fn value(self) -> i16 {
        self as i16
    }

    /// Parse a wire value.
    #[must_use]
    pub fn from_value(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::DataWritten),
            -1 => Some(Self::DataChannelFree),
            -98 => Some(Self::ClearFifoBuffer),
            -99 => Some(Self::InvalidDataReceived),
            -100 => Some(Self::InvalidDataReceivedError),
            _ => None,
        }
    }
}

impl fmt::Display for DataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataWritten => write!(f, "DataWritten"),
            Self::DataChannelFree => write!(f, "DataChannelFree"),
            Self::ClearFifoBuffer => write!(f, "ClearFifoBuffer"),
            Self::InvalidDataReceived => write!(f, "InvalidDataReceived"),
            Self::InvalidDataReceivedError => write!(f, "InvalidDataReceivedError"),
        }
    }
}

/// States of one DataChannel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    /// No message in flight.
    #[default]
    Idle,
    /// Payload and handshake are being written.
    Sending,
    /// Waiting for the PLC to answer on the handshake field.
    AwaitingHandshake,
    /// PLC freed the channel.
    Success,
    /// PLC rejected the payload; a resend is due.
    Retry,
    /// Message abandoned.
    Fatal,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Sending => write!(f, "SENDING"),
            Self::AwaitingHandshake => write!(f, "AWAITING_HANDSHAKE"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Retry => write!(f, "RETRY"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

impl ChannelState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ChannelState) -> bool {
        use ChannelState::{AwaitingHandshake, Fatal, Idle, Retry, Sending, Success};

        matches!(
            (self, target),
            (Idle, Sending)
                | (Sending, AwaitingHandshake)
                | (AwaitingHandshake, Success | Retry | Fatal)
                | (Retry, Sending)
                // Write failures abandon the message before any handshake
                | (Sending, Fatal)
                | (Success | Fatal, Idle)
        )
    }

    /// Returns true for the two terminal outcomes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fatal)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone, Default)]
pub struct ChannelStateMachine {
    current: ChannelState,
    previous: Option<ChannelState>,
    transition_count: u64,
}

impl ChannelStateMachine {
    /// Create a new state machine starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<ChannelState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidStateTransition`] if the edge does not exist.
    pub fn transition(&mut self, target: ChannelState) -> TagResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(TagError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Abandon the current message (always succeeds from a non-idle state).
    pub fn fail(&mut self) {
        if self.current.can_transition_to(ChannelState::Fatal) {
            self.previous = Some(self.current);
            self.current = ChannelState::Fatal;
            self.transition_count += 1;
        }
    }

    /// Return to IDLE after a terminal outcome.
    pub fn finish(&mut self) {
        if self.current.is_terminal() {
            self.previous = Some(self.current);
            self.current = ChannelState::Idle;
            self.transition_count += 1;
        }
    }
}
