//! Broadcast channel plumbing for metascan.
//!
//! - [`message`] -- channel names, replay positions, wire parsing, and
//!   the completion event payload.
//! - [`bus`] -- in-process publish/subscribe hub with replay.
//! - [`transport`] -- the [`ChannelTransport`] seam and its in-process
//!   implementation.
//! - [`ws`] -- WebSocket transport for a remote streaming endpoint.
//! - [`subscription`] -- single-subscription lifecycle manager.

pub mod bus;
pub mod message;
pub mod subscription;
pub mod transport;
pub mod ws;

pub use bus::EventBus;
pub use message::{ChannelMessage, ChannelName, CompletionEvent, ReplayPosition};
pub use subscription::{
    SubscriptionError, SubscriptionHandle, SubscriptionManager, SubscriptionState,
};
pub use transport::{ChannelTransport, InProcessTransport, TransportError};
pub use ws::WsTransport;
