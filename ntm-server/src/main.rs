use clap::Parser;
use ntm_server::app::redaction::{Category, RedactionConfig, RedactionMode, DEFAULT_MAX_BODY_BYTES};
use ntm_server::config::{ApiKeyBinding, AuthSettings, EventStoreSettings, FeatureFlags, OidcSettings};
use ntm_server::domain::rbac::{AuthMode, Role};
use ntm_server::{run, Settings};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "ntm control plane server", long_about = None)]
struct Cli {
    #[arg(long, env = "NTM_LISTEN", default_value = "127.0.0.1:7337", help = "Listen address for HTTP, WebSocket and SSE")]
    listen: SocketAddr,

    #[arg(long, env = "NTM_DATA_DIR", default_value = "state", help = "Directory for the database and audit log")]
    data_dir: PathBuf,

    #[arg(
        long,
        env = "NTM_DB_PATH",
        value_name = "PATH",
        help = "SQLite database file (default <data-dir>/ntm-server.db; ':memory:' keeps it in memory)"
    )]
    db_path: Option<PathBuf>,

    #[arg(long, env = "NTM_HOME", value_name = "DIR", help = "Home directory for policy, wrappers and checkpoints")]
    home: Option<PathBuf>,

    #[arg(
        long,
        env = "NTM_CORS_ORIGINS",
        value_delimiter = ',',
        help = "Allowed browser origins; '*' allows any"
    )]
    cors_origins: Vec<String>,

    #[arg(
        long,
        env = "NTM_AUTH_MODE",
        default_value = "local",
        value_parser = parse_auth_mode,
        help = "Authentication mode (local|api-key|oidc)"
    )]
    auth_mode: AuthMode,

    #[arg(
        long = "api-key",
        env = "NTM_API_KEYS",
        value_delimiter = ',',
        value_name = "KEY=USER:ROLE",
        help = "API key binding; repeatable"
    )]
    api_keys: Vec<ApiKeyBinding>,

    #[arg(long, env = "NTM_OIDC_ISSUER", help = "Expected token issuer")]
    oidc_issuer: Option<String>,

    #[arg(long, env = "NTM_OIDC_AUDIENCE", help = "Expected token audience")]
    oidc_audience: Option<String>,

    #[arg(long, env = "NTM_OIDC_JWKS_URL", help = "JWKS document URL")]
    oidc_jwks_url: Option<String>,

    #[arg(long, env = "NTM_OIDC_ROLE_CLAIM", default_value = "role", help = "Claim holding the role")]
    oidc_role_claim: String,

    #[arg(long, env = "NTM_OIDC_USER_CLAIM", default_value = "sub", help = "Claim holding the user id")]
    oidc_user_claim: String,

    #[arg(
        long,
        env = "NTM_OIDC_DEFAULT_ROLE",
        default_value = "viewer",
        value_parser = parse_role,
        help = "Role for tokens without a recognised role claim"
    )]
    oidc_default_role: Role,

    #[arg(
        long,
        env = "NTM_LOOPBACK",
        value_delimiter = ',',
        help = "Extra peer addresses treated as local"
    )]
    loopback: Vec<IpAddr>,

    #[arg(long, env = "NTM_EVENT_BUFFER", default_value_t = 0, help = "Event ring size (0 = default)")]
    event_buffer: i64,

    #[arg(long, env = "NTM_EVENT_RETENTION_SECS", default_value_t = 0, help = "Persisted event retention (0 = default)")]
    event_retention_secs: i64,

    #[arg(long, env = "NTM_AUDIT_RETENTION_DAYS", default_value_t = 0, help = "Audit index retention (0 = 90 days)")]
    audit_retention_days: i64,

    #[arg(long, env = "NTM_APPROVAL_TTL_SECS", default_value_t = 3600, help = "Lifetime of pending approvals")]
    approval_ttl_secs: u64,

    #[arg(long, env = "NTM_KERNEL_TIMEOUT_SECS", default_value_t = 60, help = "Default kernel command timeout")]
    kernel_timeout_secs: u64,

    #[arg(
        long,
        env = "NTM_REDACTION",
        default_value = "redact",
        value_parser = parse_redaction_mode,
        help = "Secret handling on bodies (off|warn|redact|block)"
    )]
    redaction: RedactionMode,

    #[arg(
        long,
        env = "NTM_REDACTION_MANDATORY",
        value_delimiter = ',',
        value_parser = parse_category,
        help = "Categories blocked even in redact mode"
    )]
    redaction_mandatory: Vec<Category>,

    #[arg(long, env = "NTM_NO_WS", help = "Disable the WebSocket endpoint")]
    no_ws: bool,

    #[arg(long, env = "NTM_NO_SSE", help = "Disable the SSE endpoint")]
    no_sse: bool,

    #[arg(long, env = "NTM_NO_OPENAPI", help = "Disable the OpenAPI document and docs page")]
    no_openapi: bool,

    #[arg(long, env = "NTM_NO_PERSIST", help = "Keep events in memory only and skip the audit index")]
    no_persist: bool,

    #[arg(long, env = "AGENT_MAIL_URL", help = "Agent mail MCP endpoint")]
    agent_mail_url: Option<String>,

    #[arg(long, env = "NTM_OTLP_ENDPOINT", help = "OTLP endpoint for metrics (e.g., http://localhost:4318)")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn into_settings(self) -> Settings {
        let oidc = match (self.oidc_issuer, self.oidc_jwks_url) {
            (None, None) => None,
            (issuer, jwks_url) => Some(OidcSettings {
                issuer: issuer.unwrap_or_default(),
                audience: self.oidc_audience,
                jwks_url: jwks_url.unwrap_or_default(),
                role_claim: self.oidc_role_claim,
                user_claim: self.oidc_user_claim,
                default_role: self.oidc_default_role,
                ..OidcSettings::default()
            }),
        };
        let mut auth = AuthSettings {
            mode: self.auth_mode,
            api_keys: self.api_keys,
            oidc,
            ..AuthSettings::default()
        };
        auth.loopback.extend(self.loopback);

        let mandatory = if self.redaction_mandatory.is_empty() {
            RedactionConfig::default().mandatory
        } else {
            self.redaction_mandatory
        };

        Settings {
            listen: self.listen,
            data_dir: self.data_dir,
            db_path: self.db_path,
            home: self.home,
            cors_origins: self.cors_origins,
            auth,
            events: EventStoreSettings {
                buffer_size: self.event_buffer,
                retention_secs: self.event_retention_secs,
                cleanup_secs: 0,
            },
            audit_retention_days: self.audit_retention_days,
            approval_ttl: Duration::from_secs(self.approval_ttl_secs),
            kernel_timeout: Duration::from_secs(self.kernel_timeout_secs),
            redaction: RedactionConfig {
                mode: self.redaction,
                mandatory,
                max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            },
            features: FeatureFlags {
                ws: !self.no_ws,
                sse: !self.no_sse,
                openapi: !self.no_openapi,
                persist: !self.no_persist,
            },
            agent_mail_url: self.agent_mail_url,
            otlp_endpoint: self.otlp_endpoint,
            ..Settings::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    run(cli.into_settings()).await
}

fn parse_auth_mode(value: &str) -> Result<AuthMode, String> {
    value.parse()
}

fn parse_role(value: &str) -> Result<Role, String> {
    value.parse()
}

fn parse_redaction_mode(value: &str) -> Result<RedactionMode, String> {
    value.parse()
}

fn parse_category(value: &str) -> Result<Category, String> {
    value.parse()
}
