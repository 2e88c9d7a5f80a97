pub mod adapters;
pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod paths;
pub mod ports;
pub mod telemetry;
#[cfg(test)]
mod testing;

pub use config::Settings;

use adapters::checkpoints::FileCheckpointStore;
use adapters::jwks::HttpJwksSource;
use adapters::kernel::ToolKernel;
use adapters::mail::AgentMailClient;
use adapters::process::ProcessCommandRunner;
use adapters::tools::ToolRegistry;
use anyhow::{Context, Result};
use app::accounts::AccountService;
use app::approvals::ApprovalService;
use app::audit::AuditStore;
use app::auth::Authenticator;
use app::events::{EventBus, WsEventStore};
use app::hub::WsHub;
use app::idempotency::IdempotencyStore;
use app::integrations::{MemoryService, ScannerService};
use app::jobs::JobService;
use app::redaction::{Redactor, SummarySink};
use app::safety::{PolicyStore, SafetyInstaller};
use app::sse::SseBroadcaster;
use app::streams::PaneStreams;
use axum::Router;
use chrono::{DateTime, Utc};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use paths::{HomePaths, PathResolver};
use ports::checkpoint_store::CheckpointStore;
use ports::command_runner::CommandRunner;
use ports::jwks::JwksSource;
use ports::kernel::Kernel;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use telemetry::ServerMetrics;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

const SERVICE_NAME: &str = "ntm-server";
const AUDIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const IDEMPOTENCY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub auth: Arc<Authenticator>,
    pub bus: Arc<EventBus>,
    pub hub: Arc<WsHub>,
    pub sse: Arc<SseBroadcaster>,
    pub audit: Arc<AuditStore>,
    pub idempotency: Arc<IdempotencyStore>,
    pub redactor: Arc<Redactor>,
    pub summaries: Arc<SummarySink>,
    pub policy: Arc<PolicyStore>,
    pub installer: Arc<SafetyInstaller>,
    pub approvals: Arc<ApprovalService>,
    pub kernel: Arc<dyn Kernel>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub tools: Arc<ToolRegistry>,
    pub jobs: Arc<JobService>,
    pub streams: Arc<PaneStreams>,
    pub accounts: Arc<AccountService>,
    pub memory: Arc<MemoryService>,
    pub scanner: Arc<ScannerService>,
    pub mail: Arc<AgentMailClient>,
    pub metrics: Option<Arc<ServerMetrics>>,
    pub paths: Arc<dyn PathResolver>,
    pub started_at: DateTime<Utc>,
}

/// Collaborators that can be swapped out; anything left `None` is built from
/// the settings.
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub kernel: Option<Arc<dyn Kernel>>,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub jwks: Option<Arc<dyn JwksSource>>,
    pub paths: Option<Arc<dyn PathResolver>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            runner: Arc::new(ProcessCommandRunner::new()),
            kernel: None,
            checkpoints: None,
            jwks: None,
            paths: None,
        }
    }
}

/// A wired server. Must be built inside a Tokio runtime: the stores start
/// their background tasks immediately.
pub struct Server {
    state: AppState,
    provider: Mutex<Option<SdkMeterProvider>>,
}

impl Server {
    pub fn build(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        settings.validate().context("invalid configuration")?;

        let (metrics, provider) = match settings.otlp_endpoint.as_deref() {
            Some(endpoint) => {
                let (provider, metrics) = telemetry::init_metrics(endpoint, SERVICE_NAME)?;
                (Some(Arc::new(metrics)), Some(provider))
            }
            None => (None, None),
        };

        let paths: Arc<dyn PathResolver> = match (collaborators.paths, settings.home.clone()) {
            (Some(paths), _) => paths,
            (None, Some(home)) => Arc::new(HomePaths::new(home)),
            (None, None) => Arc::new(HomePaths::from_env()?),
        };
        std::fs::create_dir_all(&settings.data_dir)
            .with_context(|| format!("creating data directory {}", settings.data_dir.display()))?;

        let events = settings.events.resolve()?;
        let store = if settings.features.persist {
            let conn = adapters::sqlite::open(&settings.db_path())?;
            Arc::new(WsEventStore::with_db(events, conn).context("opening event store")?)
        } else {
            Arc::new(WsEventStore::memory(events))
        };
        store.start_cleanup();

        let audit_db = if settings.features.persist {
            Some(adapters::sqlite::open(&settings.db_path())?)
        } else {
            None
        };
        let audit = Arc::new(AuditStore::open(
            &settings.audit_log_path(),
            audit_db,
            settings.audit_retention(),
        )?);
        audit.start_cleanup(AUDIT_CLEANUP_INTERVAL);

        let bus = Arc::new(EventBus::new(store.clone()));
        let hub = WsHub::start(settings.hub, store, metrics.clone());
        let sse = Arc::new(SseBroadcaster::default());
        bus.register(hub.clone());
        bus.register(sse.clone());

        let idempotency = Arc::new(IdempotencyStore::new(
            settings.idempotency_ttl(),
            settings.idempotency_capacity,
        ));
        idempotency.start_sweeper(IDEMPOTENCY_SWEEP_INTERVAL);

        let jwks = match (collaborators.jwks, settings.auth.oidc.as_ref()) {
            (Some(jwks), _) => Some(jwks),
            (None, Some(oidc)) => Some(Arc::new(HttpJwksSource::new(&oidc.jwks_url, oidc.fetch_timeout)?)
                as Arc<dyn JwksSource>),
            (None, None) => None,
        };
        let auth = Arc::new(Authenticator::new(settings.auth.clone(), jwks));

        let policy = Arc::new(PolicyStore::new(paths.clone())?);
        let installer = Arc::new(SafetyInstaller::new(paths.clone(), policy.clone()));
        let approvals = Arc::new(ApprovalService::new(
            policy.clone(),
            bus.clone(),
            settings.approval_ttl,
            metrics.clone(),
        ));

        let runner = collaborators.runner;
        let tools = Arc::new(ToolRegistry::detect(settings.tool_path.clone(), runner.clone()));
        let kernel = collaborators.kernel.unwrap_or_else(|| {
            Arc::new(ToolKernel::new(tools.clone(), runner.clone(), settings.kernel_timeout)) as Arc<dyn Kernel>
        });
        let checkpoints = collaborators.checkpoints.unwrap_or_else(|| {
            let program = tools.resolve("ntm").unwrap_or_else(|_| "ntm".into());
            Arc::new(FileCheckpointStore::new(paths.checkpoints_dir(), program, runner.clone()))
                as Arc<dyn CheckpointStore>
        });

        let jobs = Arc::new(JobService::new(kernel.clone(), bus.clone()));
        let streams = Arc::new(PaneStreams::new(kernel.clone(), bus.clone()));
        let accounts = Arc::new(AccountService::new(tools.clone(), bus.clone()));
        let memory = Arc::new(MemoryService::new(tools.clone(), paths.clone()));
        let scanner = Arc::new(ScannerService::new(tools.clone(), bus.clone()));
        let mail = Arc::new(AgentMailClient::new(settings.agent_mail_url.clone(), MAIL_TIMEOUT)?);

        let state = AppState {
            redactor: Arc::new(Redactor::new(settings.redaction.clone())),
            summaries: Arc::new(SummarySink::default()),
            settings: Arc::new(settings),
            auth,
            bus,
            hub,
            sse,
            audit,
            idempotency,
            policy,
            installer,
            approvals,
            kernel,
            checkpoints,
            tools,
            jobs,
            streams,
            accounts,
            memory,
            scanner,
            mail,
            metrics,
            paths,
            started_at: Utc::now(),
        };
        Ok(Self {
            state,
            provider: Mutex::new(provider),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        api::router(self.state.clone())
    }

    /// Serves until `shutdown` resolves, then shuts the server down.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        // Long-lived WS and SSE connections must end before graceful shutdown can finish.
        let streams = self.state.clone();
        let shutdown = async move {
            shutdown.await;
            streams.hub.close();
            streams.sse.close();
        };
        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await;
        self.shutdown().await;
        served.context("http server failed")
    }

    /// Stops background work, then closes the hub, then the audit store.
    pub async fn shutdown(&self) {
        let state = &self.state;
        state.streams.shutdown().await;
        state.jobs.shutdown();
        state.idempotency.stop().await;
        state.bus.store().stop().await;
        state.audit.stop_cleanup().await;

        state.hub.close();
        state.sse.close();

        if let Err(err) = state.audit.close() {
            warn!(%err, "closing audit store failed");
        }

        let provider = self
            .provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(provider) = provider {
            if let Err(err) = telemetry::shutdown_metrics(provider) {
                warn!(%err, "failed to shut down telemetry");
            }
        }
    }
}

pub async fn run(settings: Settings) -> Result<()> {
    let listen = settings.listen;
    let server = Server::build(settings, Collaborators::default())?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    let state = server.state();
    info!(
        listen = %listener.local_addr()?,
        auth = state.settings.auth.mode.as_str(),
        data_dir = %state.settings.data_dir.display(),
        resume_seq = state.bus.current_seq(),
        "ntm-server started"
    );
    for tool in state.tools.report().iter().filter(|tool| !tool.installed) {
        warn!(tool = tool.name, "tool not found on PATH");
    }
    server.serve(listener, shutdown_signal()).await?;
    info!("ntm-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("shutdown signal received");
}
