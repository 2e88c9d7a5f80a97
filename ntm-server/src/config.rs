use crate::adapters::sqlite::IN_MEMORY;
use crate::app::events::{EventStoreConfig, EventStoreError};
use crate::app::hub::HubConfig;
use crate::app::redaction::RedactionConfig;
use crate::domain::rbac::{AuthMode, Role};
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7337);
pub const DB_FILE_NAME: &str = "ntm-server.db";
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_KERNEL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("oidc auth mode requires {0}")]
    OidcIncomplete(&'static str),
    #[error("api-key auth mode requires at least one key")]
    NoApiKeys,
    #[error("invalid api key binding: expected key=user:role")]
    ApiKeyBinding,
    #[error("api key for {0} has unknown role '{1}'")]
    UnknownRole(String, String),
    #[error("{0} must not be negative")]
    Negative(&'static str),
}

/// `key=user:role`, as accepted on the command line and in `NTM_API_KEYS`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyBinding {
    pub key: String,
    pub user: String,
    pub role: Role,
}

impl std::fmt::Debug for ApiKeyBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyBinding")
            .field("key", &"<redacted>")
            .field("user", &self.user)
            .field("role", &self.role)
            .finish()
    }
}

impl FromStr for ApiKeyBinding {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (key, rest) = value
            .trim()
            .split_once('=')
            .ok_or(ConfigError::ApiKeyBinding)?;
        let (user, role) = rest.split_once(':').ok_or(ConfigError::ApiKeyBinding)?;
        if key.is_empty() || user.is_empty() {
            return Err(ConfigError::ApiKeyBinding);
        }
        let role = Role::parse(role);
        if !role.is_known() {
            return Err(ConfigError::UnknownRole(user.to_string(), role.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            user: user.to_string(),
            role,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidcSettings {
    pub issuer: String,
    pub audience: Option<String>,
    pub jwks_url: String,
    pub role_claim: String,
    pub user_claim: String,
    pub default_role: Role,
    pub jwks_ttl: Duration,
    pub fetch_timeout: Duration,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: None,
            jwks_url: String::new(),
            role_claim: "role".into(),
            user_claim: "sub".into(),
            default_role: Role::Viewer,
            jwks_ttl: DEFAULT_JWKS_TTL,
            fetch_timeout: crate::adapters::jwks::DEFAULT_FETCH_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthSettings {
    pub mode: AuthMode,
    pub api_keys: Vec<ApiKeyBinding>,
    pub oidc: Option<OidcSettings>,
    /// Peers treated as local in addition to the loopback ranges.
    pub loopback: Vec<IpAddr>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            mode: AuthMode::Local,
            api_keys: Vec::new(),
            oidc: None,
            loopback: vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)],
        }
    }
}

impl AuthSettings {
    pub fn is_loopback(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            other => other,
        };
        ip.is_loopback() || self.loopback.contains(&ip)
    }
}

/// Raw event store tuning; zero selects the default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventStoreSettings {
    pub buffer_size: i64,
    pub retention_secs: i64,
    pub cleanup_secs: i64,
}

impl EventStoreSettings {
    pub fn resolve(&self) -> Result<EventStoreConfig, EventStoreError> {
        EventStoreConfig::from_raw(self.buffer_size, self.retention_secs, self.cleanup_secs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureFlags {
    pub ws: bool,
    pub sse: bool,
    pub openapi: bool,
    pub persist: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            ws: true,
            sse: true,
            openapi: true,
            persist: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    /// Database file; defaults to `<data_dir>/ntm-server.db`. `:memory:` is accepted.
    pub db_path: Option<PathBuf>,
    /// Overrides `$HOME` for policy, wrappers, checkpoints and PID files.
    pub home: Option<PathBuf>,
    /// Search path for external tools; the process `PATH` when unset.
    pub tool_path: Option<OsString>,
    pub cors_origins: Vec<String>,
    pub auth: AuthSettings,
    pub events: EventStoreSettings,
    pub hub: HubConfig,
    pub audit_retention_days: i64,
    pub idempotency_ttl_secs: i64,
    pub idempotency_capacity: usize,
    pub approval_ttl: Duration,
    pub kernel_timeout: Duration,
    pub redaction: RedactionConfig,
    pub features: FeatureFlags,
    pub agent_mail_url: Option<String>,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            data_dir: PathBuf::from("state"),
            db_path: None,
            home: None,
            tool_path: None,
            cors_origins: Vec::new(),
            auth: AuthSettings::default(),
            events: EventStoreSettings::default(),
            hub: HubConfig::default(),
            audit_retention_days: 0,
            idempotency_ttl_secs: 0,
            idempotency_capacity: crate::app::idempotency::DEFAULT_CAPACITY,
            approval_ttl: crate::app::approvals::DEFAULT_APPROVAL_TTL,
            kernel_timeout: DEFAULT_KERNEL_TIMEOUT,
            redaction: RedactionConfig::default(),
            features: FeatureFlags::default(),
            agent_mail_url: None,
            otlp_endpoint: None,
        }
    }
}

impl Settings {
    /// A self-contained configuration for tests: in-memory database, data and
    /// home under `root`, and no external tools on the search path.
    pub fn isolated(root: &std::path::Path) -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            data_dir: root.join("data"),
            db_path: Some(PathBuf::from(IN_MEMORY)),
            home: Some(root.join("home")),
            tool_path: Some(root.join("bin").into_os_string()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.auth.mode {
            AuthMode::Oidc => {
                let oidc = self
                    .auth
                    .oidc
                    .as_ref()
                    .ok_or(ConfigError::OidcIncomplete("issuer and jwks url"))?;
                if oidc.issuer.trim().is_empty() {
                    return Err(ConfigError::OidcIncomplete("an issuer"));
                }
                if oidc.jwks_url.trim().is_empty() {
                    return Err(ConfigError::OidcIncomplete("a jwks url"));
                }
            }
            AuthMode::ApiKey if self.auth.api_keys.is_empty() => return Err(ConfigError::NoApiKeys),
            AuthMode::ApiKey | AuthMode::Local => {}
        }
        let events = self.events;
        for (name, value) in [
            ("event buffer size", events.buffer_size),
            ("event retention", events.retention_secs),
            ("event cleanup interval", events.cleanup_secs),
            ("audit retention", self.audit_retention_days),
        ] {
            if value < 0 {
                return Err(ConfigError::Negative(name));
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DB_FILE_NAME))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit").join("audit.jsonl")
    }

    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(self.audit_retention_days.max(0) as u64 * 24 * 3600)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_bindings_parse() {
        let binding: ApiKeyBinding = "k1=alice:operator".parse().unwrap();
        assert_eq!(binding.user, "alice");
        assert_eq!(binding.role, Role::Operator);
        assert!("k1alice:operator".parse::<ApiKeyBinding>().is_err());
        assert!(matches!(
            "k1=alice:root".parse::<ApiKeyBinding>(),
            Err(ConfigError::UnknownRole(_, _))
        ));
        assert!(!format!("{binding:?}").contains("k1"));
    }

    #[test]
    fn validation_rules() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.auth.mode = AuthMode::ApiKey;
        assert_eq!(settings.validate(), Err(ConfigError::NoApiKeys));
        settings.auth.api_keys.push("k=bob:admin".parse().unwrap());
        assert!(settings.validate().is_ok());

        settings.auth.mode = AuthMode::Oidc;
        assert!(matches!(settings.validate(), Err(ConfigError::OidcIncomplete(_))));
        settings.auth.oidc = Some(OidcSettings {
            issuer: "https://id.example".into(),
            jwks_url: "https://id.example/jwks".into(),
            ..OidcSettings::default()
        });
        assert!(settings.validate().is_ok());

        settings.events.retention_secs = -1;
        assert_eq!(
            settings.validate(),
            Err(ConfigError::Negative("event retention"))
        );
    }

    #[test]
    fn loopback_includes_mapped_addresses() {
        let auth = AuthSettings::default();
        assert!(auth.is_loopback("127.0.0.1".parse().unwrap()));
        assert!(auth.is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!auth.is_loopback("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let settings = Settings {
            data_dir: PathBuf::from("/var/ntm"),
            ..Settings::default()
        };
        assert_eq!(settings.db_path(), PathBuf::from("/var/ntm/ntm-server.db"));
        assert_eq!(
            settings.audit_log_path(),
            PathBuf::from("/var/ntm/audit/audit.jsonl")
        );
        assert_eq!(settings.audit_retention(), Duration::ZERO);
    }
}
