//! Bus server: accepts client connections and feeds their calls to the router.
//!
//! Each connection gets a unique name (`:1.N`), a writer task draining its
//! outbound queue, and a read loop that decodes frames, pairs them with the
//! descriptors that arrived alongside, and routes the calls in order.

use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use portal_protocol::{
    ClientMessage, FrameCodec, FrameDecoder, ServerMessage, MAX_FDS_PER_FRAME,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::fdpass::{recv_with_fds, write_all};
use super::{BusError, Connection};
use crate::router::MessageRouter;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A server that listens for bus connections on a Unix domain socket.
pub struct BusServer {
    listener: UnixListener,
    path: PathBuf,
    next_id: AtomicU64,
}

impl BusServer {
    /// Bind the server to the specified socket path.
    ///
    /// This will create the socket file and any necessary parent directories.
    /// If a socket file already exists at the path, it will be removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The parent directories cannot be created
    /// - The existing socket cannot be removed
    /// - The socket cannot be bound
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Path of the listening socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Cancelling also ends every open connection, running its disconnect
    /// sweep. The socket file is removed on return.
    pub async fn serve(self, router: Arc<MessageRouter>, shutdown: CancellationToken) {
        info!(path = %self.path.display(), "Bus listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept bus connection");
                    continue;
                }
            };

            let pid = match stream.peer_cred() {
                Ok(cred) => cred.pid(),
                Err(e) => {
                    debug!(error = %e, "Peer credentials unavailable");
                    None
                }
            };
            let unique_name = format!(":1.{}", self.next_id.fetch_add(1, Ordering::Relaxed));

            let router = Arc::clone(&router);
            let token = shutdown.child_token();
            tokio::spawn(async move {
                handle_connection(stream, unique_name, pid, router, token).await;
            });
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Could not remove socket");
        }
        info!("Bus stopped");
    }
}

async fn handle_connection(
    stream: UnixStream,
    unique_name: String,
    pid: Option<i32>,
    router: Arc<MessageRouter>,
    shutdown: CancellationToken,
) {
    let stream = Arc::new(stream);
    let (connection, outbound) = Connection::new(unique_name, pid);
    router.sender_connected(&connection);

    let writer = tokio::spawn(write_loop(Arc::clone(&stream), outbound));

    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        result = read_loop(&stream, &connection, &router) => result,
    };
    match result {
        Ok(()) => trace!(sender = connection.unique_name(), "Read loop finished"),
        Err(e) => warn!(sender = connection.unique_name(), error = %e, "Connection failed"),
    }

    router.sender_disconnected(&connection);
    writer.abort();
}

async fn read_loop(
    stream: &UnixStream,
    connection: &Arc<Connection>,
    router: &MessageRouter,
) -> Result<(), BusError> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut decoder = FrameDecoder::new();
    let mut fds: VecDeque<OwnedFd> = VecDeque::new();

    loop {
        let n = recv_with_fds(stream, &mut buf, &mut fds).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);

        while let Some(frame) = decoder.next_frame()? {
            let announced = frame.fd_count as usize;
            if announced > fds.len() {
                return Err(BusError::MissingDescriptors {
                    announced,
                    received: fds.len(),
                });
            }
            let attached: Vec<OwnedFd> = fds.drain(..announced).collect();

            let message = ClientMessage::from_frame(&frame)?;
            let serial = message.serial;
            let result = router
                .route(connection, message.call, attached)
                .await
                .map_err(|e| {
                    debug!(sender = connection.unique_name(), serial, error = %e, "Call failed");
                    e.to_error_reply()
                });

            connection.send(ServerMessage::Reply { serial, result });
        }

        // Descriptors may only precede the rest of a partially read frame.
        if decoder.buffered() == 0 && !fds.is_empty() {
            warn!(
                sender = connection.unique_name(),
                count = fds.len(),
                "Closing unannounced descriptors"
            );
            fds.clear();
        }
        if fds.len() > MAX_FDS_PER_FRAME {
            return Err(BusError::TooManyDescriptors { queued: fds.len() });
        }
    }
}

async fn write_loop(stream: Arc<UnixStream>, mut outbound: mpsc::UnboundedReceiver<ServerMessage>) {
    let codec = FrameCodec::new();

    while let Some(message) = outbound.recv().await {
        let bytes = match message.to_frame().and_then(|frame| codec.encode(&frame)) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to encode outbound message");
                continue;
            }
        };
        if let Err(e) = write_all(&stream, &bytes).await {
            debug!(error = %e, "Peer stopped reading");
            break;
        }
    }
}
