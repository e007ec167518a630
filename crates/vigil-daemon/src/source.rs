//! Event intake socket.
//!
//! The kernel-side companion pushes length-prefixed event frames over a
//! unix stream socket; this task decodes them and feeds the producer's
//! channel source. Malformed frames are dropped and counted - the
//! connection survives, matching the drop-and-continue policy for parse
//! errors.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use vigil_core::event::{decode_frame, Event};
use vigil_core::SecurityEngine;

/// Accepts intake connections on `path` and pumps decoded events into
/// `tx` until the listener fails or every receiver is gone.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn serve(
    path: &Path,
    tx: mpsc::Sender<Event>,
    engine: Arc<SecurityEngine>,
) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "event intake listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        debug!("event source connected");
        if pump(stream, &tx, &engine).await.is_err() {
            // The producer hung up; no point accepting more sources.
            return Ok(());
        }
    }
}

/// Reads one connection to EOF. `Err` means the channel is closed.
async fn pump(
    mut stream: UnixStream,
    tx: &mpsc::Sender<Event>,
    engine: &Arc<SecurityEngine>,
) -> Result<(), ()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut chunk = vec![0u8; 32 * 1024];

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => {
                debug!("event source disconnected");
                return Ok(());
            },
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                loop {
                    match decode_frame(&mut buf) {
                        Ok(Some(event)) => {
                            if tx.send(event).is_err() {
                                return Err(());
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            // Unframed garbage cannot be resynchronized;
                            // drop the buffer and keep the connection.
                            warn!(%err, "dropping malformed event data");
                            engine.note_dropped_event();
                            buf.clear();
                            break;
                        },
                    }
                }
            },
            Err(err) => {
                warn!(%err, "event source read failed");
                return Ok(());
            },
        }
    }
}
