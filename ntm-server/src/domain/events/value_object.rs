use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subscription filter over topics: `*`, `prefix:*`, or an exact topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TopicGlob {
    All,
    Prefix(String),
    Exact(String),
}

impl TopicGlob {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicGlob::All => true,
            TopicGlob::Prefix(prefix) => topic
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with(':')),
            TopicGlob::Exact(exact) => exact == topic,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, TopicGlob::All)
    }

    /// Whether every topic matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &TopicGlob) -> bool {
        match (self, other) {
            (TopicGlob::All, _) => true,
            (_, TopicGlob::All) => false,
            (TopicGlob::Prefix(mine), TopicGlob::Prefix(theirs)) => {
                theirs == mine || self.matches(theirs)
            }
            (_, TopicGlob::Exact(topic)) => self.matches(topic),
            (TopicGlob::Exact(_), TopicGlob::Prefix(_)) => false,
        }
    }
}

impl FromStr for TopicGlob {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err("topic must be non-empty".into());
        }
        if value == "*" {
            return Ok(TopicGlob::All);
        }
        if let Some(prefix) = value.strip_suffix(":*") {
            if prefix.is_empty() || prefix.contains('*') {
                return Err(format!("invalid topic glob '{value}'"));
            }
            return Ok(TopicGlob::Prefix(prefix.to_string()));
        }
        if value.contains('*') {
            return Err(format!("wildcards are only allowed as '*' or 'prefix:*' ('{value}')"));
        }
        Ok(TopicGlob::Exact(value.to_string()))
    }
}

impl fmt::Display for TopicGlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicGlob::All => f.write_str("*"),
            TopicGlob::Prefix(prefix) => write!(f, "{prefix}:*"),
            TopicGlob::Exact(topic) => f.write_str(topic),
        }
    }
}

impl Serialize for TopicGlob {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TopicGlob {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

pub mod topics {
    pub const APPROVALS: &str = "approvals";
    pub const JOBS: &str = "jobs";
    pub const SAFETY: &str = "safety";
    pub const SCANNER: &str = "scanner";
    pub const ACCOUNTS: &str = "accounts";
    pub const SYSTEM: &str = "system";

    pub fn session(session: &str) -> String {
        format!("sessions:{session}")
    }

    pub fn pane(session: &str, index: u32) -> String {
        format!("panes:{session}:{index}")
    }

    pub fn approval(id: &str) -> String {
        format!("approvals:{id}")
    }

    pub fn job(id: &str) -> String {
        format!("jobs:{id}")
    }

    pub fn checkpoints(session: &str) -> String {
        format!("checkpoints:{session}")
    }

    pub fn pipeline(id: &str) -> String {
        format!("pipelines:{id}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    BufferFull,
    HubOverflow,
    ClientClosed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::BufferFull => "buffer_full",
            DropReason::HubOverflow => "hub_overflow",
            DropReason::ClientClosed => "client_closed",
        }
    }
}

impl FromStr for DropReason {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "buffer_full" => Ok(DropReason::BufferFull),
            "hub_overflow" => Ok(DropReason::HubOverflow),
            "client_closed" => Ok(DropReason::ClientClosed),
            other => Err(format!("unknown drop reason '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(value: &str) -> TopicGlob {
        value.parse().unwrap()
    }

    #[test]
    fn glob_forms_match() {
        assert!(glob("*").matches("sessions:foo"));
        assert!(glob("sessions:*").matches("sessions:foo"));
        assert!(!glob("sessions:*").matches("sessions"));
        assert!(!glob("sessions:*").matches("sessionsx:foo"));
        assert!(glob("panes:foo:*").matches("panes:foo:2"));
        assert!(glob("approvals").matches("approvals"));
        assert!(!glob("approvals").matches("approvals:apr-1"));
    }

    #[test]
    fn rejects_inner_wildcards() {
        assert!("ses*ons".parse::<TopicGlob>().is_err());
        assert!(":*".parse::<TopicGlob>().is_err());
        assert!("".parse::<TopicGlob>().is_err());
    }

    #[test]
    fn coverage_is_reflexive_and_prefix_aware() {
        assert!(glob("*").covers(&glob("sessions:*")));
        assert!(glob("sessions:*").covers(&glob("sessions:foo")));
        assert!(glob("panes:*").covers(&glob("panes:foo:*")));
        assert!(!glob("sessions:*").covers(&glob("*")));
        assert!(!glob("sessions:foo").covers(&glob("sessions:*")));
    }
}
