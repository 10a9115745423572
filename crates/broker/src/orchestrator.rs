//! Broker orchestrator for wiring together all components.
//!
//! This module provides the `BrokerOrchestrator` that builds the collaborators
//! named by the configuration (permission store, document store, desktop
//! backends, identity resolver), assembles the router and runs the bus
//! server until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    AccessBackend, ActionActivator, DocumentStore, ExecBackend, NotificationBackend,
    PassthroughDocumentStore,
};
use crate::bus::BusServer;
use crate::config::Config;
use crate::consent::ConsentGate;
use crate::identity::{IdentityResolver, ProcIdentityResolver};
use crate::permissions::{FilePermissionStore, PermissionStore, PermissionStoreClient};
use crate::portals::{ActionsPortal, FileTransferPortal, NotificationPortal};
use crate::request::RequestRegistry;
use crate::router::MessageRouter;
use crate::transfer::TransferManager;

/// Broker orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the bus socket.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// External collaborators the broker talks to.
#[derive(Clone)]
pub struct BrokerComponents {
    pub identity: Arc<dyn IdentityResolver>,
    pub permissions: Arc<dyn PermissionStore>,
    pub access: Arc<dyn AccessBackend>,
    pub documents: Arc<dyn DocumentStore>,
    pub notifications: Arc<dyn NotificationBackend>,
    pub actions: Arc<dyn ActionActivator>,
}

impl BrokerComponents {
    /// Default collaborators for a desktop session.
    ///
    /// Loads the permission store file; dialogs, notifications and action
    /// activation go through the configured commands.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store_path = config.permission_store_path();
        let permissions = FilePermissionStore::open(&store_path)
            .with_context(|| format!("Failed to load permission store: {}", store_path.display()))?;
        let exec = Arc::new(ExecBackend::new(config.backend.clone()));

        Ok(Self {
            identity: Arc::new(ProcIdentityResolver::new()),
            permissions: Arc::new(permissions),
            access: exec.clone(),
            documents: Arc::new(PassthroughDocumentStore::new(&config.documents.mount_point)),
            notifications: exec.clone(),
            actions: exec,
        })
    }
}

/// Broker orchestrator that manages all subsystems.
pub struct BrokerOrchestrator {
    /// Socket the bus listens on.
    socket_path: PathBuf,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Message router shared with every connection.
    router: Arc<MessageRouter>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Bus server task while running.
    server_task: Option<JoinHandle<()>>,
}

impl BrokerOrchestrator {
    /// Creates an orchestrator with the collaborators named by `config`.
    pub fn new(config: Config) -> Result<Self> {
        let components = BrokerComponents::from_config(&config)?;
        Ok(Self::with_components(&config, components))
    }

    /// Creates an orchestrator around the given collaborators.
    pub fn with_components(config: &Config, components: BrokerComponents) -> Self {
        let permissions = PermissionStoreClient::new(components.permissions);
        let requests = RequestRegistry::new();

        let transfers = Arc::new(TransferManager::new(
            components.documents,
            config.transfer.max_key_attempts,
        ));
        let actions = ActionsPortal::new(
            requests.clone(),
            ConsentGate::new(permissions.clone(), components.access),
            components.actions,
        );
        let notifications = NotificationPortal::new(components.notifications, permissions);

        let router = Arc::new(MessageRouter::new(
            components.identity,
            requests,
            FileTransferPortal::new(transfers),
            actions,
            notifications,
        ));

        Self {
            socket_path: config.socket_path(),
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            router,
            shutdown_token: CancellationToken::new(),
            server_task: None,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Socket path the bus binds to.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Returns the message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Binds the bus socket and starts serving connections.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        info!("Starting portal broker...");

        let server = match BusServer::bind(&self.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| {
                    format!("Failed to bind bus socket: {}", self.socket_path.display())
                });
            }
        };

        let router = Arc::clone(&self.router);
        let token = self.shutdown_token.clone();
        self.server_task = Some(tokio::spawn(server.serve(router, token)));

        *self.state.write().await = OrchestratorState::Running;
        info!(socket = %self.socket_path.display(), "Portal broker started");
        Ok(())
    }

    /// Stops serving and ends every connection.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Running {
                debug!("Orchestrator not running, nothing to stop");
                return Ok(());
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!("Stopping portal broker...");
        self.shutdown_token.cancel();

        if let Some(task) = self.server_task.take() {
            if let Err(e) = task.await {
                warn!("Bus server task failed: {}", e);
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Portal broker stopped");
        Ok(())
    }
}
