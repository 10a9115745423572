//! Bus client used by the CLI and by tests to talk to a running broker.
//!
//! Calls are answered in order; signals that arrive while a reply is awaited
//! are queued and handed out by [`BusClient::next_signal`].

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use portal_protocol::{
    BrokerStatus, Call, ClientMessage, FrameCodec, FrameDecoder, Options, Reply, ServerMessage,
    Signal, TransferOptions,
};
use serde_json::Value;
use tokio::net::UnixStream;

use super::fdpass::{recv_with_fds, send_with_fds};
use super::BusError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A connection to the broker.
pub struct BusClient {
    stream: UnixStream,
    decoder: FrameDecoder,
    next_serial: u32,
    unique_name: String,
    signals: VecDeque<Signal>,
    timeout: Duration,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("unique_name", &self.unique_name)
            .field("next_serial", &self.next_serial)
            .finish_non_exhaustive()
    }
}

impl BusClient {
    /// Connect to the broker at the specified socket path.
    ///
    /// Performs the `Hello` exchange, so the unique name is known on return.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the broker is not running.
    pub async fn connect(path: &Path) -> Result<Self, BusError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the broker with a custom timeout.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, BusError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| BusError::Timeout)??;

        let mut client = Self {
            stream,
            decoder: FrameDecoder::new(),
            next_serial: 1,
            unique_name: String::new(),
            signals: VecDeque::new(),
            timeout,
        };

        match client.call(Call::Hello).await? {
            Reply::Hello { unique_name } => client.unique_name = unique_name,
            other => return Err(unexpected(&other)),
        }
        Ok(client)
    }

    /// Unique name the broker assigned to this connection.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a call and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Remote`] when the broker answers with an error,
    /// [`BusError::Timeout`] when no reply arrives in time.
    pub async fn call(&mut self, call: Call) -> Result<Reply, BusError> {
        self.call_with_fds(call, &[]).await
    }

    /// Send a call with descriptors attached and wait for its reply.
    pub async fn call_with_fds(
        &mut self,
        call: Call,
        fds: &[BorrowedFd<'_>],
    ) -> Result<Reply, BusError> {
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        tokio::time::timeout(self.timeout, self.call_internal(call, &raw))
            .await
            .map_err(|_| BusError::Timeout)?
    }

    async fn call_internal(&mut self, call: Call, fds: &[RawFd]) -> Result<Reply, BusError> {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);

        let frame = ClientMessage::new(serial, call).to_frame(fds.len())?;
        let bytes = FrameCodec::new().encode(&frame)?;
        send_with_fds(&self.stream, &bytes, fds).await?;

        loop {
            match self.read_message().await? {
                ServerMessage::Reply {
                    serial: replied,
                    result,
                } if replied == serial => {
                    return result.map_err(|e| BusError::Remote {
                        code: e.code,
                        message: e.message,
                    });
                }
                ServerMessage::Reply { serial: stray, .. } => {
                    return Err(BusError::UnexpectedReply(format!(
                        "reply for serial {} while waiting for {}",
                        stray, serial
                    )));
                }
                ServerMessage::Signal(signal) => self.signals.push_back(signal),
            }
        }
    }

    /// Wait for the next signal from the broker.
    pub async fn next_signal(&mut self) -> Result<Signal, BusError> {
        if let Some(signal) = self.signals.pop_front() {
            return Ok(signal);
        }

        tokio::time::timeout(self.timeout, self.read_signal())
            .await
            .map_err(|_| BusError::Timeout)?
    }

    async fn read_signal(&mut self) -> Result<Signal, BusError> {
        match self.read_message().await? {
            ServerMessage::Signal(signal) => Ok(signal),
            ServerMessage::Reply { serial, .. } => Err(BusError::UnexpectedReply(format!(
                "unsolicited reply for serial {}",
                serial
            ))),
        }
    }

    async fn read_message(&mut self) -> Result<ServerMessage, BusError> {
        let mut buf = [0u8; 8192];
        // The broker never sends descriptors; anything received is closed on drop.
        let mut fds: VecDeque<OwnedFd> = VecDeque::new();

        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(ServerMessage::from_frame(&frame)?);
            }
            let n = recv_with_fds(&self.stream, &mut buf, &mut fds).await?;
            if n == 0 {
                return Err(BusError::Closed);
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    // ==========================================================================
    // Typed calls
    // ==========================================================================

    /// Broker statistics.
    pub async fn status(&mut self) -> Result<BrokerStatus, BusError> {
        match self.call(Call::Status).await? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    /// Close the request exported at `handle`.
    pub async fn close_request(&mut self, handle: &str) -> Result<(), BusError> {
        self.call(Call::CloseRequest {
            handle: handle.to_string(),
        })
        .await
        .and_then(expect_empty)
    }

    /// Start a transfer and return its key.
    pub async fn start_transfer(&mut self, options: TransferOptions) -> Result<String, BusError> {
        match self.call(Call::StartTransfer { options }).await? {
            Reply::TransferKey { key } => Ok(key),
            other => Err(unexpected(&other)),
        }
    }

    /// Add the given descriptors to a transfer.
    pub async fn add_files(&mut self, key: &str, files: &[BorrowedFd<'_>]) -> Result<(), BusError> {
        let call = Call::AddFiles {
            key: key.to_string(),
            fds: (0..files.len() as u32).collect(),
            options: Options::new(),
        };
        self.call_with_fds(call, files).await.and_then(expect_empty)
    }

    /// Retrieve the files of a transfer as paths valid for this client.
    pub async fn retrieve_files(&mut self, key: &str) -> Result<Vec<String>, BusError> {
        let call = Call::RetrieveFiles {
            key: key.to_string(),
            options: Options::new(),
        };
        match self.call(call).await? {
            Reply::Files { files } => Ok(files),
            other => Err(unexpected(&other)),
        }
    }

    /// Stop a transfer.
    pub async fn stop_transfer(&mut self, key: &str) -> Result<(), BusError> {
        self.call(Call::StopTransfer {
            key: key.to_string(),
        })
        .await
        .and_then(expect_empty)
    }

    /// Ask to activate `action` of `application`; returns the request handle.
    ///
    /// The outcome arrives later as a `Response` signal.
    pub async fn activate_action(
        &mut self,
        application: &str,
        action: &str,
        parameters: Vec<Value>,
        options: Options,
    ) -> Result<String, BusError> {
        let call = Call::ActivateAction {
            parent_window: String::new(),
            application: application.to_string(),
            action: action.to_string(),
            parameters,
            options,
        };
        match self.call(call).await? {
            Reply::Handle { handle } => Ok(handle),
            other => Err(unexpected(&other)),
        }
    }

    /// Show a notification.
    pub async fn add_notification(
        &mut self,
        id: &str,
        notification: Options,
    ) -> Result<(), BusError> {
        self.call(Call::AddNotification {
            id: id.to_string(),
            notification,
        })
        .await
        .and_then(expect_empty)
    }

    /// Withdraw a notification.
    pub async fn remove_notification(&mut self, id: &str) -> Result<(), BusError> {
        self.call(Call::RemoveNotification { id: id.to_string() })
            .await
            .and_then(expect_empty)
    }
}

fn unexpected(reply: &Reply) -> BusError {
    BusError::UnexpectedReply(format!("{:?}", reply))
}

fn expect_empty(reply: Reply) -> Result<(), BusError> {
    match reply {
        Reply::Empty => Ok(()),
        other => Err(unexpected(&other)),
    }
}
