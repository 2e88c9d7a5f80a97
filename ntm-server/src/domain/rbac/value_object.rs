use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

bitflags! {
    pub struct Permissions: u32 {
        const READ_SESSIONS = 1 << 0;
        const WRITE_SESSIONS = 1 << 1;
        const READ_AGENTS = 1 << 2;
        const WRITE_AGENTS = 1 << 3;
        const READ_CHECKPOINTS = 1 << 4;
        const WRITE_CHECKPOINTS = 1 << 5;
        const READ_PIPELINES = 1 << 6;
        const WRITE_PIPELINES = 1 << 7;
        const READ_JOBS = 1 << 8;
        const WRITE_JOBS = 1 << 9;
        const READ_APPROVALS = 1 << 10;
        const REQUEST_APPROVALS = 1 << 11;
        const APPROVE_REQUESTS = 1 << 12;
        const READ_SAFETY = 1 << 13;
        const WRITE_SAFETY = 1 << 14;
        const READ_AUDIT = 1 << 15;
        const READ_EVENTS = 1 << 16;
        const READ_HEALTH = 1 << 17;
        const READ_INTEGRATIONS = 1 << 18;
        const WRITE_INTEGRATIONS = 1 << 19;
        const DANGEROUS_OPS = 1 << 20;
        const SYSTEM_CONFIG = 1 << 21;

        const VIEWER = Self::READ_SESSIONS.bits
            | Self::READ_AGENTS.bits
            | Self::READ_CHECKPOINTS.bits
            | Self::READ_PIPELINES.bits
            | Self::READ_JOBS.bits
            | Self::READ_APPROVALS.bits
            | Self::READ_SAFETY.bits
            | Self::READ_EVENTS.bits
            | Self::READ_HEALTH.bits
            | Self::READ_INTEGRATIONS.bits;
        const OPERATOR = Self::VIEWER.bits
            | Self::WRITE_SESSIONS.bits
            | Self::WRITE_AGENTS.bits
            | Self::WRITE_CHECKPOINTS.bits
            | Self::WRITE_PIPELINES.bits
            | Self::WRITE_JOBS.bits
            | Self::WRITE_INTEGRATIONS.bits
            | Self::REQUEST_APPROVALS.bits
            | Self::APPROVE_REQUESTS.bits;
        const ADMIN = Self::OPERATOR.bits
            | Self::WRITE_SAFETY.bits
            | Self::READ_AUDIT.bits
            | Self::DANGEROUS_OPS.bits
            | Self::SYSTEM_CONFIG.bits;
    }
}

const PERMISSION_NAMES: &[(Permissions, &str)] = &[
    (Permissions::READ_SESSIONS, "read-sessions"),
    (Permissions::WRITE_SESSIONS, "write-sessions"),
    (Permissions::READ_AGENTS, "read-agents"),
    (Permissions::WRITE_AGENTS, "write-agents"),
    (Permissions::READ_CHECKPOINTS, "read-checkpoints"),
    (Permissions::WRITE_CHECKPOINTS, "write-checkpoints"),
    (Permissions::READ_PIPELINES, "read-pipelines"),
    (Permissions::WRITE_PIPELINES, "write-pipelines"),
    (Permissions::READ_JOBS, "read-jobs"),
    (Permissions::WRITE_JOBS, "write-jobs"),
    (Permissions::READ_APPROVALS, "read-approvals"),
    (Permissions::REQUEST_APPROVALS, "request-approvals"),
    (Permissions::APPROVE_REQUESTS, "approve-requests"),
    (Permissions::READ_SAFETY, "read-safety"),
    (Permissions::WRITE_SAFETY, "write-safety"),
    (Permissions::READ_AUDIT, "read-audit"),
    (Permissions::READ_EVENTS, "read-events"),
    (Permissions::READ_HEALTH, "read-health"),
    (Permissions::READ_INTEGRATIONS, "read-integrations"),
    (Permissions::WRITE_INTEGRATIONS, "write-integrations"),
    (Permissions::DANGEROUS_OPS, "dangerous-ops"),
    (Permissions::SYSTEM_CONFIG, "system-config"),
];

impl Permissions {
    pub fn names(&self) -> Vec<&'static str> {
        PERMISSION_NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl Serialize for Permissions {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.names().serialize(serializer)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Operator,
    Viewer,
    Unknown(String),
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "operator" => Role::Operator,
            "viewer" => Role::Viewer,
            other => Role::Unknown(other.to_string()),
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Operator => 2,
            Role::Viewer => 1,
            Role::Unknown(_) => 0,
        }
    }

    pub fn permissions(&self) -> Permissions {
        match self {
            Role::Admin => Permissions::ADMIN,
            Role::Operator => Permissions::OPERATOR,
            Role::Viewer => Permissions::VIEWER,
            Role::Unknown(_) => Permissions::empty(),
        }
    }

    pub fn at_least(&self, other: &Role) -> bool {
        self.rank() >= other.rank()
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::Unknown(name) => name.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Role::Unknown(_))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match Role::parse(value) {
            Role::Unknown(name) => Err(format!("unknown role '{name}'")),
            role => Ok(role),
        }
    }
}

impl Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Role::parse(&value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Local,
    ApiKey,
    Oidc,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Local => "local",
            AuthMode::ApiKey => "api_key",
            AuthMode::Oidc => "oidc",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local" => Ok(AuthMode::Local),
            "api_key" | "apikey" => Ok(AuthMode::ApiKey),
            "oidc" => Ok(AuthMode::Oidc),
            other => Err(format!("unsupported auth mode '{other}'")),
        }
    }
}
