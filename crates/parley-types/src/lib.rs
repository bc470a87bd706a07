//! Wire protocol and shared view models for the Parley chat gateway.
//!
//! Every frame on the socket is a JSON object carrying a `type`
//! discriminator. Inbound frames parse into [`frames::ClientFrame`]; the
//! server only ever emits [`frames::ServerFrame`].

pub mod api;
pub mod frames;
pub mod models;

/// The room every authenticated user belongs to.
pub const GLOBAL_ROOM_ID: &str = "global";
