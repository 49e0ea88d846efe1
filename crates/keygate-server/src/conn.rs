//! Per-connection driver.
//!
//! Reads raw chunks into the incremental decoder, dispatches each completed
//! message under the shared registry lock, and writes the reply before
//! touching the next message, so replies always come back in request order.

use bytes::BytesMut;
use keygate_core::{SessionError, Storage};
use keygate_proto::{MessageDecoder, Reply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::SharedRegistry;
use crate::error::ServerError;
use crate::transport::Conn;

/// Drives one connection until the client disconnects or a framing error
/// forces a hard close.
///
/// # Errors
///
/// Only storage failures surface as errors; they are fatal to the process.
/// Client misbehavior (framing violations) and transport I/O problems end
/// the connection quietly.
pub async fn serve<S: Storage>(
    mut conn: Conn,
    peer: &str,
    registry: &SharedRegistry<S>,
) -> Result<(), ServerError> {
    let mut decoder = MessageDecoder::new();
    let mut chunk = [0_u8; 4096];
    let mut out = BytesMut::with_capacity(256);

    loop {
        let n = match conn.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(peer, "connection closed");
                return Ok(());
            },
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(peer, "read error: {err}");
                return Ok(());
            },
        };
        decoder.feed(&chunk[..n]);

        loop {
            let message = match decoder.try_next() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    // No resync point exists; drop the connection without a
                    // reply.
                    tracing::warn!(peer, "framing violation: {err}");
                    return Ok(());
                },
            };

            let result = {
                let mut registry = registry.lock().await;
                registry.dispatch(&message).await
            };
            let reply = match result {
                Ok(reply) => reply,
                Err(SessionError::Storage(err)) => return Err(ServerError::Storage(err)),
                Err(err) => {
                    tracing::debug!(peer, "request rejected: {err}");
                    Reply::Error(err.to_string())
                },
            };

            out.clear();
            reply.encode(&mut out);
            if let Err(err) = conn.write_all(&out).await {
                tracing::debug!(peer, "write error: {err}");
                return Ok(());
            }
        }
    }
}
