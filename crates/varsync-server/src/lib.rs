pub mod batcher;
pub mod client;
pub mod config;
pub mod handler;
pub mod outgoing;
pub mod pending;
pub mod server;
pub mod sessions;
pub mod transport;
pub mod websocket;

pub use client::ConnectionHub;
pub use config::ServerConfig;
pub use server::{build_router, start, AppState, ServerHandle};
pub use sessions::{SessionEntry, SessionManager};
pub use transport::TransportError;
