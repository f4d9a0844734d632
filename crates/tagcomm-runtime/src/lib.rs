//! Tag model, listeners, controller and DataChannels on top of an ADS transport.
//!
//! The pieces fit together like this:
//!
//! * [`TagArena`] owns every [`Tag`]; everything else refers to tags by [`TagId`].
//! * [`TagAccess`] moves raw bytes between tags and an [`AdsTransport`] and
//!   runs them through the [`ValueCodec`].
//! * A [`TagListener`] keeps tracked tags in sync, either by polling through
//!   a [`PollingManager`] or by PLC-side notifications.
//! * The [`TagController`] serializes writes.
//! * [`DataChannelWriter`] and [`DataChannelListener`] layer the handshake
//!   protocol over the controller and a listener.
//!
//! [`AdsTransport`]: tagcomm_transport::AdsTransport
//! [`ValueCodec`]: tagcomm_codec::ValueCodec

pub mod access;
pub mod controller;
pub mod datachannel;
pub mod events;
pub mod listener;
pub mod polling;
pub mod tag;

pub use access::{AccessTarget, Layout, TagAccess};
pub use controller::{TagController, WriteCompletion};
pub use datachannel::{
    validate_channel, ChannelBinding, ChannelRecord, DataChannelEvents, DataChannelListener,
    DataChannelWriter, MessageKind, MessageOutcome, RawRecord, WriterEvents,
};
pub use events::{
    CollectedTagsChanged, CommunicationProblem, ConnectionStateChanged, EventHub, ListenerEvents,
    ProblemSource, SubscriptionId, TagChanged,
};
pub use listener::{
    build_listener, CycleOutcome, ListenerCore, NotificationTagListener, PollingTagListener,
    TagListener, TagSet,
};
pub use polling::{PollingManager, PollingStats, PollingStatsSnapshot};
pub use tag::{AddressState, Tag, TagArena, TagId, TagIdentity, TagSpec, ValueGuard};
