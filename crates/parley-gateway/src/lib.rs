//! Realtime core of the Parley chat server: sessions, rooms, messages,
//! presence, fan-out and chunked uploads behind one command dispatcher.

pub mod ai;
pub mod auth;
pub mod bitfield;
pub mod bot;
pub mod cache;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod game;
pub mod messages;
pub mod polls;
pub mod presence;
pub mod rooms;
pub mod scheduler;
pub mod sessions;
pub mod storage;
pub mod store;
pub mod uploads;

pub use ai::{CompletionProvider, HttpCompletionProvider};
pub use config::GatewayConfig;
pub use connection::handle_socket;
pub use dispatcher::{ClientConn, Flow, Gateway};
pub use error::{AuthError, GatewayError};
