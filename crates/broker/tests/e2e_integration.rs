//! End-to-end integration tests for the portal broker.
//!
//! These tests run a real bus server on a temporary socket and verify
//! complete flows:
//! - File transfer between applications, with descriptor passing
//! - Request creation, consent, response and close
//! - Sender disconnect sweep
//! - Notification validation

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use broker::backend::{
    AccessBackend, AccessDialog, AccessResponse, ActionActivator, ActionListener, BackendError,
    BackendHandle, DocumentAddFlags, DocumentPermissions, DocumentStore, NotificationBackend,
};
use broker::bus::{BusClient, BusError};
use broker::config::Config;
use broker::identity::{AppInfo, IdentityError, IdentityResolver};
use broker::orchestrator::{BrokerComponents, BrokerOrchestrator};
use broker::permissions::FilePermissionStore;
use broker::Connection;
use portal_protocol::{ErrorCode, Options, ResponseCode, Signal, TransferOptions};
use serde_json::{json, Value};
use tempfile::TempDir;

// =============================================================================
// Test collaborators
// =============================================================================

/// Maps bus unique names to identities; unknown names are the host.
#[derive(Default)]
struct NameResolver {
    apps: HashMap<String, AppInfo>,
}

impl NameResolver {
    fn with(mut self, unique_name: &str, app: AppInfo) -> Self {
        self.apps.insert(unique_name.to_string(), app);
        self
    }
}

impl IdentityResolver for NameResolver {
    fn resolve(&self, connection: &Connection) -> Result<AppInfo, IdentityError> {
        Ok(self
            .apps
            .get(connection.unique_name())
            .cloned()
            .unwrap_or_else(AppInfo::host))
    }
}

/// Returns a scripted id per file and records each batch.
struct ScriptedDocuments {
    mount_point: PathBuf,
    ids: Vec<String>,
    calls: Mutex<Vec<(usize, DocumentAddFlags, String, DocumentPermissions)>>,
}

impl ScriptedDocuments {
    fn new(mount_point: &Path, ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            mount_point: mount_point.to_path_buf(),
            ids: ids.iter().map(|id| id.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DocumentStore for ScriptedDocuments {
    fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    async fn batch_add(
        &self,
        fds: &[OwnedFd],
        flags: DocumentAddFlags,
        _owner: &AppInfo,
        target_app_id: &str,
        permissions: DocumentPermissions,
    ) -> Result<Vec<String>, BackendError> {
        self.calls.lock().unwrap().push((
            fds.len(),
            flags,
            target_app_id.to_string(),
            permissions,
        ));
        Ok(self.ids.iter().take(fds.len()).cloned().collect())
    }
}

enum Answer {
    Grant,
    WaitForClose,
}

struct ScriptedAccess {
    answer: Answer,
    shown: AtomicUsize,
}

#[async_trait]
impl AccessBackend for ScriptedAccess {
    async fn access_dialog(
        &self,
        handle: &BackendHandle,
        _app_id: &str,
        _parent_window: &str,
        _dialog: &AccessDialog,
    ) -> Result<AccessResponse, BackendError> {
        self.shown.fetch_add(1, Ordering::SeqCst);
        let response = match self.answer {
            Answer::Grant => ResponseCode::Success,
            Answer::WaitForClose => {
                handle.closed().await;
                ResponseCode::Cancelled
            }
        };
        Ok(AccessResponse {
            response,
            results: Options::new(),
        })
    }
}

#[derive(Default)]
struct RecordingDesktop {
    activated: Mutex<Vec<(String, String, Vec<Value>)>>,
    notifications: Mutex<Vec<(String, String)>>,
    listeners: Mutex<Vec<Arc<dyn ActionListener>>>,
}

#[async_trait]
impl ActionActivator for RecordingDesktop {
    async fn activate_action(
        &self,
        application: &str,
        action: &str,
        parameters: &[Value],
        _platform_data: &Options,
    ) -> Result<(), BackendError> {
        self.activated.lock().unwrap().push((
            application.to_string(),
            action.to_string(),
            parameters.to_vec(),
        ));
        Ok(())
    }
}

#[async_trait]
impl NotificationBackend for RecordingDesktop {
    async fn add_notification(
        &self,
        app_id: &str,
        id: &str,
        _notification: &Options,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), BackendError> {
        self.listeners.lock().unwrap().push(listener);
        self.notifications
            .lock()
            .unwrap()
            .push((app_id.to_string(), id.to_string()));
        Ok(())
    }

    async fn remove_notification(&self, _app_id: &str, _id: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    orchestrator: BrokerOrchestrator,
    socket_path: PathBuf,
    documents: Arc<ScriptedDocuments>,
    access: Arc<ScriptedAccess>,
    desktop: Arc<RecordingDesktop>,
    temp_dir: TempDir,
}

impl Harness {
    /// Clients connect as `:1.1`, `:1.2`, ... in order.
    async fn start(resolver: NameResolver, doc_ids: &[&str], answer: Answer) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("bus.sock");

        let mut config = Config::default();
        config.broker.data_dir = temp_dir.path().to_path_buf();
        config.broker.socket_path = Some(socket_path.clone());

        let documents = ScriptedDocuments::new(&temp_dir.path().join("doc"), doc_ids);
        let access = Arc::new(ScriptedAccess {
            answer,
            shown: AtomicUsize::new(0),
        });
        let desktop = Arc::new(RecordingDesktop::default());

        let components = BrokerComponents {
            identity: Arc::new(resolver),
            permissions: Arc::new(FilePermissionStore::in_memory()),
            access: access.clone(),
            documents: documents.clone(),
            notifications: desktop.clone(),
            actions: desktop.clone(),
        };

        let mut orchestrator = BrokerOrchestrator::with_components(&config, components);
        orchestrator.start().await.unwrap();

        Self {
            orchestrator,
            socket_path,
            documents,
            access,
            desktop,
            temp_dir,
        }
    }

    async fn connect(&self) -> BusClient {
        BusClient::connect(&self.socket_path).await.unwrap()
    }

    fn create_file(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path.canonicalize().unwrap()
    }

    async fn stop(mut self) {
        self.orchestrator.stop().await.unwrap();
    }
}

fn remote_code(err: BusError) -> ErrorCode {
    err.code()
        .unwrap_or_else(|| panic!("expected a remote error, got {:?}", err))
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// File Transfer Tests
// =============================================================================

#[tokio::test]
async fn test_transfer_to_sandboxed_recipient_with_plain_path() {
    let resolver = NameResolver::default()
        .with(":1.1", AppInfo::sandboxed("org.example.Sender"))
        .with(":1.2", AppInfo::sandboxed("org.example.Recipient"));
    let harness = Harness::start(resolver, &[""], Answer::Grant).await;
    let mut sender = harness.connect().await;
    let mut recipient = harness.connect().await;
    assert_eq!(sender.unique_name(), ":1.1");
    assert_eq!(recipient.unique_name(), ":1.2");

    let path = harness.create_file("a.txt");
    let file = File::open(&path).unwrap();

    let key = sender
        .start_transfer(TransferOptions {
            writable: Some(false),
            autostop: Some(true),
        })
        .await
        .unwrap();
    assert!(key.parse::<u32>().is_ok());
    sender.add_files(&key, &[file.as_fd()]).await.unwrap();

    let files = recipient.retrieve_files(&key).await.unwrap();
    assert_eq!(files, vec![path.to_string_lossy().into_owned()]);

    {
        let calls = harness.documents.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (count, flags, target, permissions) = &calls[0];
        assert_eq!(*count, 1);
        assert!(flags.contains(DocumentAddFlags::REUSE_EXISTING));
        assert!(flags.contains(DocumentAddFlags::AS_NEEDED_BY_APP));
        assert_eq!(target, "org.example.Recipient");
        assert_eq!(*permissions, DocumentPermissions::READ);
    }

    // Autostop made the key unusable.
    let err = recipient.retrieve_files(&key).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::AccessDenied);

    harness.stop().await;
}

#[tokio::test]
async fn test_transfer_maps_documents_under_mount_point() {
    let resolver = NameResolver::default()
        .with(":1.1", AppInfo::sandboxed("org.example.Sender"))
        .with(":1.2", AppInfo::sandboxed("org.example.Recipient"));
    let harness = Harness::start(resolver, &["d1", ""], Answer::Grant).await;
    let mut sender = harness.connect().await;
    let mut recipient = harness.connect().await;

    let first = harness.create_file("first.txt");
    let second = harness.create_file("second.txt");
    let a = File::open(&first).unwrap();
    let b = File::open(&second).unwrap();

    let key = sender
        .start_transfer(TransferOptions {
            writable: None,
            autostop: Some(false),
        })
        .await
        .unwrap();
    sender.add_files(&key, &[a.as_fd()]).await.unwrap();
    sender.add_files(&key, &[b.as_fd()]).await.unwrap();

    let files = recipient.retrieve_files(&key).await.unwrap();
    let mount = harness.temp_dir.path().join("doc");
    assert_eq!(
        files,
        vec![
            mount.join("d1").join("first.txt").to_string_lossy().into_owned(),
            second.to_string_lossy().into_owned(),
        ]
    );

    // Without autostop the session survives until stopped.
    assert_eq!(recipient.retrieve_files(&key).await.unwrap().len(), 2);
    recipient.stop_transfer(&key).await.unwrap();
    let err = sender.retrieve_files(&key).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::AccessDenied);
    let err = sender.add_files(&key, &[b.as_fd()]).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::AccessDenied);

    harness.stop().await;
}

#[tokio::test]
async fn test_host_recipient_gets_original_paths() {
    let resolver = NameResolver::default().with(":1.1", AppInfo::sandboxed("org.example.Sender"));
    let harness = Harness::start(resolver, &["ignored"], Answer::Grant).await;
    let mut sender = harness.connect().await;
    let mut host = harness.connect().await;

    let path = harness.create_file("host.txt");
    let file = File::open(&path).unwrap();

    let key = sender.start_transfer(TransferOptions::default()).await.unwrap();
    sender.add_files(&key, &[file.as_fd()]).await.unwrap();

    let files = host.retrieve_files(&key).await.unwrap();
    assert_eq!(files, vec![path.to_string_lossy().into_owned()]);
    assert!(harness.documents.calls.lock().unwrap().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_writable_transfer_rejects_read_only_descriptor() {
    let harness = Harness::start(NameResolver::default(), &[""], Answer::Grant).await;
    let mut sender = harness.connect().await;

    let read_only = File::open(harness.create_file("ro.txt")).unwrap();
    let read_write = OpenOptions::new()
        .read(true)
        .write(true)
        .open(harness.create_file("rw.txt"))
        .unwrap();

    let key = sender
        .start_transfer(TransferOptions {
            writable: Some(true),
            autostop: Some(false),
        })
        .await
        .unwrap();

    let err = sender
        .add_files(&key, &[read_write.as_fd(), read_only.as_fd()])
        .await
        .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::NotAllowed);

    let session = harness
        .orchestrator
        .router()
        .file_transfer()
        .transfers()
        .lookup(&key)
        .unwrap();
    assert!(session.is_empty());

    sender.add_files(&key, &[read_write.as_fd()]).await.unwrap();
    assert_eq!(session.len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_add_files_from_foreign_sender_denied() {
    let harness = Harness::start(NameResolver::default(), &[""], Answer::Grant).await;
    let mut owner = harness.connect().await;
    let mut intruder = harness.connect().await;

    let file = File::open(harness.create_file("x.txt")).unwrap();
    let key = owner.start_transfer(TransferOptions::default()).await.unwrap();

    let err = intruder.add_files(&key, &[file.as_fd()]).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::AccessDenied);

    let err = owner.add_files("12345", &[file.as_fd()]).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::AccessDenied);

    harness.stop().await;
}

#[tokio::test]
async fn test_add_files_rejects_directory_descriptor() {
    let harness = Harness::start(NameResolver::default(), &[""], Answer::Grant).await;
    let mut owner = harness.connect().await;

    let dir = File::open(harness.temp_dir.path()).unwrap();
    let key = owner.start_transfer(TransferOptions::default()).await.unwrap();

    let err = owner.add_files(&key, &[dir.as_fd()]).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::NotAllowed);

    harness.stop().await;
}

// =============================================================================
// Request Tests
// =============================================================================

#[tokio::test]
async fn test_activate_action_emits_single_response() {
    let resolver = NameResolver::default().with(":1.1", AppInfo::sandboxed("org.example.A"));
    let harness = Harness::start(resolver, &[], Answer::Grant).await;
    let mut client = harness.connect().await;

    let mut options = Options::new();
    options.insert("handle_token".to_string(), json!("t1"));
    let handle = client
        .activate_action("org.example.B", "open", vec![json!("file:///x")], options)
        .await
        .unwrap();
    assert_eq!(handle, "/org/freedesktop/portal/desktop/request/1_1/t1");

    match client.next_signal().await.unwrap() {
        Signal::Response {
            handle: signalled,
            response,
            ..
        } => {
            assert_eq!(signalled, handle);
            assert_eq!(response, ResponseCode::Success);
        }
        other => panic!("unexpected signal: {:?}", other),
    }
    assert_eq!(
        *harness.desktop.activated.lock().unwrap(),
        vec![(
            "org.example.B".to_string(),
            "open".to_string(),
            vec![json!("file:///x")]
        )]
    );

    // The first grant is remembered.
    client
        .activate_action("org.example.B", "open", vec![], Options::new())
        .await
        .unwrap();
    client.next_signal().await.unwrap();
    assert_eq!(harness.access.shown.load(Ordering::SeqCst), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_close_request_suppresses_response() {
    let resolver = NameResolver::default().with(":1.1", AppInfo::sandboxed("org.example.A"));
    let harness = Harness::start(resolver, &[], Answer::WaitForClose).await;
    let mut client = harness.connect().await;

    let handle = client
        .activate_action("org.example.B", "quit", vec![], Options::new())
        .await
        .unwrap();
    wait_for(|| harness.access.shown.load(Ordering::SeqCst) == 1).await;

    client.close_request(&handle).await.unwrap();
    assert_eq!(client.status().await.unwrap().requests, 0);

    let err = client.close_request(&handle).await.unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::UnknownObject);

    client.set_timeout(Duration::from_millis(200));
    assert!(matches!(client.next_signal().await, Err(BusError::Timeout)));
    assert!(harness.desktop.activated.lock().unwrap().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_disconnect_sweeps_outstanding_requests() {
    let harness = Harness::start(NameResolver::default(), &[], Answer::WaitForClose).await;
    let mut leaving = harness.connect().await;
    let mut observer = harness.connect().await;

    for token in ["a", "b", "c"] {
        let mut options = Options::new();
        options.insert("handle_token".to_string(), json!(token));
        leaving
            .activate_action("org.example.B", "quit", vec![], options)
            .await
            .unwrap();
    }
    assert_eq!(observer.status().await.unwrap().requests, 3);

    drop(leaving);

    let router = Arc::clone(harness.orchestrator.router());
    wait_for(|| router.requests().is_empty() && router.status().connections == 1).await;
    let status = observer.status().await.unwrap();
    assert_eq!(status.requests, 0);
    assert_eq!(status.connections, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_handle_token_rejected() {
    let harness = Harness::start(NameResolver::default(), &[], Answer::Grant).await;
    let mut client = harness.connect().await;

    let mut options = Options::new();
    options.insert("handle_token".to_string(), json!("no-dashes"));
    let err = client
        .activate_action("org.example.B", "quit", vec![], options)
        .await
        .unwrap_err();
    assert_eq!(remote_code(err), ErrorCode::InvalidArgument);

    harness.stop().await;
}

// =============================================================================
// Notification Tests
// =============================================================================

#[tokio::test]
async fn test_notification_validation_and_delivery() {
    let resolver = NameResolver::default().with(":1.1", AppInfo::sandboxed("org.example.A"));
    let harness = Harness::start(resolver, &[], Answer::Grant).await;
    let mut client = harness.connect().await;

    let mut bad = Options::new();
    bad.insert("title".to_string(), json!("Hi"));
    bad.insert("priority".to_string(), json!("extreme"));
    let err = client.add_notification("n1", bad).await.unwrap_err();
    match err {
        BusError::Remote { code, message } => {
            assert_eq!(code, ErrorCode::InvalidArgument);
            assert!(message.starts_with("invalid notification: "));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let mut good = Options::new();
    good.insert("title".to_string(), json!("Hi"));
    good.insert("body".to_string(), json!("There"));
    client.add_notification("n1", good).await.unwrap();

    let desktop = Arc::clone(&harness.desktop);
    wait_for(|| desktop.notifications.lock().unwrap().len() == 1).await;
    assert_eq!(
        desktop.notifications.lock().unwrap()[0],
        ("org.example.A".to_string(), "n1".to_string())
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_notification_action_relayed_to_owner() {
    let resolver = NameResolver::default()
        .with(":1.1", AppInfo::sandboxed("org.example.A"))
        .with(":1.2", AppInfo::sandboxed("org.example.A"));
    let harness = Harness::start(resolver, &[], Answer::Grant).await;
    let mut owner = harness.connect().await;
    let mut bystander = harness.connect().await;

    let mut notification = Options::new();
    notification.insert("title".to_string(), json!("Build finished"));
    notification.insert("default-action".to_string(), json!("app.open"));
    notification.insert("default-action-target".to_string(), json!(7));
    owner.add_notification("build", notification).await.unwrap();

    let desktop = Arc::clone(&harness.desktop);
    wait_for(|| desktop.listeners.lock().unwrap().len() == 1).await;
    let listener = Arc::clone(&desktop.listeners.lock().unwrap()[0]);
    listener.action_invoked("org.example.A", "build", "app.open", vec![json!(7)]);

    match owner.next_signal().await.unwrap() {
        Signal::ActionInvoked {
            id,
            action,
            parameter,
        } => {
            assert_eq!(id, "build");
            assert_eq!(action, "app.open");
            assert_eq!(parameter, vec![json!(7)]);
        }
        other => panic!("unexpected signal: {:?}", other),
    }

    bystander.set_timeout(Duration::from_millis(200));
    assert!(matches!(bystander.next_signal().await, Err(BusError::Timeout)));

    harness.stop().await;
}

// =============================================================================
// Status Tests
// =============================================================================

#[tokio::test]
async fn test_status_reports_connections_and_transfers() {
    let harness = Harness::start(NameResolver::default(), &[], Answer::Grant).await;
    let mut first = harness.connect().await;
    let _second = harness.connect().await;

    first.start_transfer(TransferOptions::default()).await.unwrap();

    let status = first.status().await.unwrap();
    assert_eq!(status.connections, 2);
    assert_eq!(status.transfers, 1);

    harness.stop().await;
}
