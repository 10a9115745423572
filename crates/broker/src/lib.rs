//! # Portal Broker Library
//!
//! This crate provides the broker that mediates privileged desktop
//! operations on behalf of sandboxed applications.
//!
//! ## Overview
//!
//! - **Request Lifecycle**: exported per-call objects that a caller can
//!   close and that end with exactly one `Response` signal
//! - **File Transfer**: key-addressed sessions that hand files from one
//!   application to another through the document store
//! - **Consent**: stored decisions first, then an access dialog, with the
//!   outcome recorded per feature policy
//! - **Portals**: file transfer, notifications and action activation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Broker Orchestrator                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │              Bus Server (Unix socket + SCM_RIGHTS)         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                   Message Router                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Request    │  │   Transfer   │  │   Consent Gate       │  │
//! │  │   Registry   │  │   Manager    │  │                      │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │  Identity    │  │  Permission  │  │  Backends            │  │
//! │  │  Resolver    │  │  Store       │  │  (dialog, documents) │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use broker::{BrokerOrchestrator, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = BrokerOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`bus`]: Socket transport, connections and the client
//! - [`identity`]: Caller identity and descriptor resolution
//! - [`permissions`]: Permission store and its typed client
//! - [`request`]: Request objects and their registry
//! - [`transfer`]: File transfer sessions
//! - [`consent`]: Stored-or-asked permission decisions
//! - [`backend`]: Dialog, document, notification and action collaborators
//! - [`portals`]: Feature portals
//! - [`router`]: Call routing
//! - [`orchestrator`]: Main broker coordinator

pub mod backend;
pub mod bus;
pub mod config;
pub mod consent;
pub mod identity;
pub mod orchestrator;
pub mod permissions;
pub mod portals;
pub mod request;
pub mod router;
pub mod transfer;

// Re-export protocol for convenience
pub use portal_protocol as protocol;

pub use config::Config;

pub use bus::{BusClient, BusError, BusServer, Connection};

pub use identity::{AppInfo, IdentityError, IdentityResolver, ProcIdentityResolver};

pub use permissions::{FilePermissionStore, Permission, PermissionStore, PermissionStoreClient};

pub use request::{Request, RequestError, RequestRegistry};

pub use transfer::{FileTransfer, TransferError, TransferManager};

pub use consent::{ConsentDecision, ConsentGate, ConsentRequest, PersistPolicy};

pub use portals::{ActionsPortal, FileTransferPortal, NotificationPortal, PortalError};

pub use router::{MessageRouter, RouterResult};

pub use orchestrator::{BrokerComponents, BrokerOrchestrator, OrchestratorState};
