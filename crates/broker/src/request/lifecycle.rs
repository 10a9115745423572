//! A single request and its state transitions.

use std::sync::{Arc, Mutex, MutexGuard};

use portal_protocol::{Options, ResponseCode, Signal};
use tracing::{debug, warn};

use super::registry::RequestRegistry;
use super::RequestError;
use crate::backend::BackendHandle;
use crate::bus::Connection;
use crate::identity::AppInfo;

#[derive(Debug, Default)]
struct RequestState {
    exported: bool,
    finished: bool,
    connection: Option<Arc<Connection>>,
    backend: Option<BackendHandle>,
}

/// One pending interaction on behalf of a client.
///
/// All transitions go through the per-request mutex. The registry table
/// lock is only ever taken while holding it, never the other way round.
#[derive(Debug)]
pub struct Request {
    id: String,
    sender: String,
    app_info: AppInfo,
    registry: RequestRegistry,
    state: Mutex<RequestState>,
}

impl Request {
    pub(super) fn new(
        id: String,
        sender: String,
        app_info: AppInfo,
        registry: RequestRegistry,
    ) -> Self {
        Self {
            id,
            sender,
            app_info,
            registry,
            state: Mutex::new(RequestState::default()),
        }
    }

    /// Object path of the request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique name of the owning connection.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Identity of the owner.
    pub fn app_info(&self) -> &AppInfo {
        &self.app_info
    }

    /// Whether the request is currently reachable at its path.
    pub fn is_exported(&self) -> bool {
        self.state().exported
    }

    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(handle = %self.id, "Request lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Make the request reachable at its path for `connection`.
    ///
    /// If the owner has already disconnected the request is closed straight
    /// away, since the disconnect sweep may have run before it was exported.
    pub fn export(self: &Arc<Self>, connection: &Arc<Connection>) -> Result<(), RequestError> {
        {
            let mut state = self.state();
            if state.exported || state.finished {
                return Err(RequestError::AlreadyExported(self.id.clone()));
            }
            self.registry.insert(self)?;
            state.exported = true;
            state.connection = Some(Arc::clone(connection));
        }
        debug!(handle = %self.id, sender = %self.sender, "Exported request");

        if connection.is_closed() {
            debug!(handle = %self.id, "Owner gone during export, closing request");
            self.close();
        }
        Ok(())
    }

    /// Make the request unreachable. Returns false if it was not exported.
    pub fn unexport(&self) -> bool {
        let mut state = self.state();
        self.unexport_locked(&mut state)
    }

    fn unexport_locked(&self, state: &mut RequestState) -> bool {
        if !state.exported {
            return false;
        }
        state.exported = false;
        state.finished = true;
        state.connection = None;
        state.backend = None;
        self.registry.remove(&self.id, self);
        debug!(handle = %self.id, "Unexported request");
        true
    }

    /// Attach (or detach) the backend handle mirroring this request.
    pub fn set_backend_handle(&self, handle: Option<BackendHandle>) {
        self.state().backend = handle;
    }

    /// Close the request on behalf of its owner.
    ///
    /// Forwards the close to the backend handle, if any, then unexports.
    /// No response is emitted. Returns false if the request was not exported.
    pub fn close(&self) -> bool {
        let mut state = self.state();
        if let Some(backend) = state.backend.take() {
            debug!(handle = %self.id, backend = backend.path(), "Closing backend handle");
            backend.close();
        }
        self.unexport_locked(&mut state)
    }

    /// Deliver the terminal response to the owner and unexport.
    ///
    /// A no-op returning false when the request is not exported, e.g. after
    /// it was closed or already responded.
    pub fn emit_response(&self, response: ResponseCode, results: Options) -> bool {
        let mut state = self.state();
        if !state.exported {
            debug!(handle = %self.id, ?response, "Request not exported, dropping response");
            return false;
        }

        if let Some(connection) = &state.connection {
            connection.emit_signal(Signal::Response {
                handle: self.id.clone(),
                response,
                results,
            });
        }
        debug!(handle = %self.id, ?response, "Emitted response");
        self.unexport_locked(&mut state)
    }
}
