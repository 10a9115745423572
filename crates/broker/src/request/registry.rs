//! Table of exported requests, keyed by object path.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portal_protocol::REQUEST_PATH_PREFIX;
use tracing::{debug, info};

use super::lifecycle::Request;
use super::RequestError;
use crate::identity::AppInfo;

#[derive(Debug, Default)]
struct RegistryInner {
    requests: DashMap<String, Arc<Request>>,
    counters: DashMap<String, u64>,
}

/// Shared registry of exported requests.
///
/// Cloning is cheap; clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct RequestRegistry {
    inner: Arc<RegistryInner>,
}

/// Turns a unique name into a path element: `:1.42` becomes `1_42`.
pub fn escape_sender(sender: &str) -> String {
    sender.strip_prefix(':').unwrap_or(sender).replace('.', "_")
}

fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unexported request for `sender`.
    ///
    /// The path is `<prefix>/<escaped sender>/<token>`; without a token a
    /// per-sender counter is used instead.
    pub fn create(
        &self,
        app_info: AppInfo,
        sender: &str,
        handle_token: Option<&str>,
    ) -> Result<Arc<Request>, RequestError> {
        let element = match handle_token {
            Some(token) if !valid_token(token) => {
                return Err(RequestError::InvalidToken(token.to_string()))
            }
            Some(token) => token.to_string(),
            None => {
                let mut counter = self.inner.counters.entry(sender.to_string()).or_insert(0);
                *counter += 1;
                counter.to_string()
            }
        };
        let id = format!(
            "{}/{}/{}",
            REQUEST_PATH_PREFIX,
            escape_sender(sender),
            element
        );

        Ok(Arc::new(Request::new(
            id,
            sender.to_string(),
            app_info,
            self.clone(),
        )))
    }

    /// The request exported at `handle`.
    pub fn lookup(&self, handle: &str) -> Option<Arc<Request>> {
        self.inner
            .requests
            .get(handle)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of exported requests.
    pub fn len(&self) -> usize {
        self.inner.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.requests.is_empty()
    }

    /// Close every request owned by `sender`. Returns how many were closed.
    pub fn close_requests_for_sender(&self, sender: &str) -> usize {
        // Collect first: closing re-enters the table to unexport.
        let owned: Vec<Arc<Request>> = self
            .inner
            .requests
            .iter()
            .filter(|entry| entry.value().sender() == sender)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = 0;
        for request in owned {
            if request.close() {
                closed += 1;
            }
        }
        self.inner.counters.remove(sender);

        if closed > 0 {
            info!(sender, closed, "Closed requests of departed sender");
        }
        closed
    }

    pub(super) fn insert(&self, request: &Arc<Request>) -> Result<(), RequestError> {
        match self.inner.requests.entry(request.id().to_string()) {
            Entry::Occupied(_) => Err(RequestError::DuplicateId(request.id().to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(request));
                Ok(())
            }
        }
    }

    pub(super) fn remove(&self, handle: &str, request: &Request) {
        let removed = self
            .inner
            .requests
            .remove_if(handle, |_, entry| std::ptr::eq(Arc::as_ptr(entry), request));
        if removed.is_none() {
            debug!(handle, "Request already gone from registry");
        }
    }
}
