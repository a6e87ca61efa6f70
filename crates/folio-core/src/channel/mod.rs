//! Realtime change channel
//!
//! A persistent WebSocket connection to the library server carrying change
//! notifications in both directions.
//!
//! ## Protocol
//!
//! 1. Connect to `{server}/ws` with the API token as a bearer header
//! 2. Receive `{type, file, origin}` JSON messages pushed by other clients
//! 3. Send the same schema when a local change was uploaded (best-effort)
//!
//! The channel only forwards events. Applying them, and re-running a full
//! reconciliation after every connection, is the coordinator's job.
//!
//! ## Usage
//!
//! ```ignore
//! let mut handle = spawn_channel(ChannelConfig::new(channel_url(server)?));
//! while let Some(event) = handle.event_rx.recv().await { ... }
//! ```

mod client;
mod message;

pub use client::{
    backoff_delay, channel_url, spawn_channel, ChannelCommand, ChannelConfig, ChannelEvent,
    ChannelHandle, ChannelStatus,
};
pub use message::ChannelMessage;
