use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::events::{EventBus, ServerEvent};

/// One physical read is one logical message; payloads larger than this are
/// observed as multiple messages. No reassembly is attempted.
pub const READ_CHUNK: usize = 4096;

/// Acknowledgment prefix, followed by the raw bytes of the payload. The
/// misspelling is part of the wire protocol.
pub const ECHO_PREFIX: &[u8] = b"Server has recived: ";

/// Sent to the peer right before an idle connection is closed.
pub const TIMEOUT_NOTICE: &[u8] = b"Client timed out";

/// Resolves once the shutdown flag is set. A closed channel (the server is
/// gone) counts as shutdown. The watch guard is dropped in here so the
/// future's output carries no borrow into `select!` arms.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Drive one accepted connection until idle timeout, peer close, shutdown,
/// or an I/O error. Errors stay in this handler; the accept loop only logs
/// them.
pub(crate) async fn handle(
    mut socket: TcpStream,
    peer: SocketAddr,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
    idle_timeout: Duration,
) -> io::Result<()> {
    let mut buf = [0u8; READ_CHUNK];

    info!(%peer, "client connected");

    loop {
        // Race the read against a fresh idle timer and the shutdown signal.
        // Exactly one branch runs per iteration.
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => {
                // Server is stopping; close without a word.
                break;
            }

            _ = sleep(idle_timeout) => {
                debug!(%peer, "idle timeout");
                // The peer is told why it is being dropped, unless shutdown
                // wins first. A failed or abandoned notice changes nothing;
                // the socket closes either way.
                tokio::select! {
                    _ = shutdown_signalled(&mut shutdown) => {}
                    _ = socket.write_all(TIMEOUT_NOTICE) => {}
                }
                break;
            }

            read = socket.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break; // peer closed its end
                }

                let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                events.emit(ServerEvent::Message(text));

                // The acknowledgment must observe shutdown too: a peer that
                // never drains its receive buffer would otherwise park this
                // handler in the write past stop(). A partial ack is fine,
                // the connection is going away.
                tokio::select! {
                    _ = shutdown_signalled(&mut shutdown) => break,
                    ack = write_ack(&mut socket, &buf[..n]) => ack?,
                }
            }
        }
    }

    info!(%peer, "client disconnected");
    Ok(())
}

/// Acknowledge with the raw payload bytes, not the trimmed text.
async fn write_ack(socket: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    socket.write_all(ECHO_PREFIX).await?;
    socket.write_all(payload).await
}
