// Shared harness for the end-to-end tests: a real server on an ephemeral
// port, an isolated home/data directory, and a kernel double.
#![allow(dead_code)]

use async_trait::async_trait;
use ntm_server::config::{ApiKeyBinding, AuthSettings};
use ntm_server::domain::rbac::{AuthMode, Role};
use ntm_server::ports::kernel::{Kernel, KernelCall};
use ntm_server::ports::AdapterError;
use ntm_server::{Collaborators, Server, Settings};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const ALICE: &str = "alice-key";
pub const BOB: &str = "bob-key";
pub const VERA: &str = "vera-key";

/// Answers kernel commands from a table and records every call.
#[derive(Default)]
pub struct TableKernel {
    responses: Mutex<HashMap<String, Result<Value, AdapterError>>>,
    calls: Mutex<Vec<KernelCall>>,
}

impl TableKernel {
    pub fn respond(&self, command: &str, result: Result<Value, AdapterError>) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), result);
    }

    pub fn calls_to(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.command == command)
            .count()
    }
}

#[async_trait]
impl Kernel for TableKernel {
    async fn call(&self, call: KernelCall) -> Result<Value, AdapterError> {
        let result = self
            .responses
            .lock()
            .unwrap()
            .get(&call.command)
            .cloned()
            .unwrap_or_else(|| Ok(json!({ "command": call.command })));
        self.calls.lock().unwrap().push(call);
        result
    }
}

pub struct TestServer {
    pub base: String,
    pub kernel: Arc<TableKernel>,
    pub server: Arc<Server>,
    pub dir: TempDir,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap();
        }
    }
}

/// `alice` is an operator, `bob` an admin and `vera` a viewer.
pub fn api_keys(settings: &mut Settings) {
    let binding = |key: &str, user: &str, role: Role| ApiKeyBinding {
        key: key.into(),
        user: user.into(),
        role,
    };
    settings.auth = AuthSettings {
        mode: AuthMode::ApiKey,
        api_keys: vec![
            binding(ALICE, "alice", Role::Operator),
            binding(BOB, "bob", Role::Admin),
            binding(VERA, "vera", Role::Viewer),
        ],
        ..AuthSettings::default()
    };
}

pub async fn start(configure: impl FnOnce(&mut Settings)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::isolated(dir.path());
    configure(&mut settings);

    let kernel = Arc::new(TableKernel::default());
    let server = Arc::new(
        Server::build(
            settings,
            Collaborators {
                kernel: Some(kernel.clone() as Arc<dyn Kernel>),
                ..Collaborators::default()
            },
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        serving
            .serve(listener, async move {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        base,
        kernel,
        server,
        dir,
        stop: Some(stop),
        handle: Some(handle),
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}
