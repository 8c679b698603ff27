//! The local socket: one listener, two protocols, told apart by the first
//! four bytes of each connection.

pub mod detect;
pub mod packet;
pub mod text;

use std::io;
use std::sync::Arc;

use axum::Router;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tracing::{debug, warn};

use crate::sessions::SessionManager;
use detect::Protocol;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("unknown session {0:?}")]
    SessionNotFound(String),
}

/// What every accepted connection needs.
#[derive(Clone)]
pub struct Transport {
    pub manager: Arc<SessionManager>,
    /// Serves text-protocol connections.
    pub router: Router,
}

impl Transport {
    pub fn new(manager: Arc<SessionManager>, router: Router) -> Self {
        Self { manager, router }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self, listener: UnixListener) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "socket accept failed");
                    continue;
                }
            };
            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.serve_connection(stream).await {
                    debug!(error = %e, "socket connection ended");
                }
            });
        }
    }

    /// Detect the protocol and run the matching handler to completion.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (protocol, stream) = detect::detect(stream).await?;
        debug!(?protocol, "socket connection accepted");
        match protocol {
            Protocol::Text => text::serve_stream(stream, self.router.clone()).await,
            Protocol::Packet => packet::serve(stream, &self.manager).await,
        }
    }
}
