//! Acceptance scenarios.
//!
//! - Tag model: identity, change events, listener dedupe
//! - DataChannel: handshake outcomes, retry bound, FIFO order, both directions
//! - Listener: polling and notification refresh, recovery after redeploy

mod common;
mod datachannel_test;
mod listener_test;
mod tag_model_test;
