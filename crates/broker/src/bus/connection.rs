//! Server-side view of one connected client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use portal_protocol::{ServerMessage, Signal};
use tokio::sync::mpsc;
use tracing::trace;

use crate::identity::AppInfo;

/// A connected client, addressed by its unique name.
///
/// Outbound messages are queued to the connection's writer task. Once the
/// peer is gone the connection is marked closed and further messages are
/// dropped.
#[derive(Debug)]
pub struct Connection {
    unique_name: String,
    pid: Option<i32>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    closed: AtomicBool,
    app_info: OnceLock<AppInfo>,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    pub fn new(
        unique_name: impl Into<String>,
        pid: Option<i32>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            unique_name: unique_name.into(),
            pid,
            outbound,
            closed: AtomicBool::new(false),
            app_info: OnceLock::new(),
        });
        (connection, rx)
    }

    /// Unique bus name of the peer, e.g. `:1.42`.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Process id from the socket credentials, if known.
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Whether the peer has disconnected.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the peer as disconnected.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Queue a message for the peer. Returns false if it was dropped.
    pub fn send(&self, message: ServerMessage) -> bool {
        if self.is_closed() {
            trace!(peer = %self.unique_name, "Dropping message for closed connection");
            return false;
        }
        self.outbound.send(message).is_ok()
    }

    /// Queue a signal for the peer.
    pub fn emit_signal(&self, signal: Signal) -> bool {
        self.send(ServerMessage::Signal(signal))
    }

    /// Identity cached from an earlier resolution.
    pub(crate) fn cached_app_info(&self) -> Option<&AppInfo> {
        self.app_info.get()
    }

    pub(crate) fn cache_app_info(&self, info: AppInfo) {
        let _ = self.app_info.set(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_protocol::{Options, ResponseCode};

    fn response(handle: &str) -> Signal {
        Signal::Response {
            handle: handle.to_string(),
            response: ResponseCode::Success,
            results: Options::new(),
        }
    }

    #[test]
    fn test_emit_signal_reaches_queue() {
        let (connection, mut rx) = Connection::new(":1.1", Some(100));
        assert_eq!(connection.unique_name(), ":1.1");
        assert_eq!(connection.pid(), Some(100));

        assert!(connection.emit_signal(response("/a")));
        match rx.try_recv().unwrap() {
            ServerMessage::Signal(signal) => assert_eq!(signal, response("/a")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_closed_connection_drops_messages() {
        let (connection, mut rx) = Connection::new(":1.2", None);
        connection.mark_closed();

        assert!(connection.is_closed());
        assert!(!connection.emit_signal(response("/b")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_app_info_cached_once() {
        let (connection, _rx) = Connection::new(":1.3", None);
        assert!(connection.cached_app_info().is_none());

        connection.cache_app_info(AppInfo::sandboxed("org.example.A"));
        connection.cache_app_info(AppInfo::sandboxed("org.example.B"));
        assert_eq!(
            connection.cached_app_info(),
            Some(&AppInfo::sandboxed("org.example.A"))
        );
    }
}
