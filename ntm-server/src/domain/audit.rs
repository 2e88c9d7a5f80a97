use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 1000;

/// One row per authenticated request that reached a handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub request_id: String,
    pub user_id: String,
    pub role: String,
    pub action: String,
    pub resource: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub session_id: Option<String>,
    pub approval_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditFilter {
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None | Some(0) => DEFAULT_QUERY_LIMIT,
            Some(limit) => limit.min(MAX_QUERY_LIMIT),
        }
    }
}

/// Maps an HTTP method and route suffix to the verb stored in `action`.
pub fn audit_verb(method: &str, path: &str) -> &'static str {
    let last = path.rsplit('/').next().unwrap_or_default();
    match (method, last) {
        ("POST", "approve") => "approve",
        ("POST", "deny") => "deny",
        ("POST", "request") => "request",
        ("POST", "cancel") => "cancel",
        ("POST", "install") => "install",
        ("POST", "uninstall") => "uninstall",
        ("POST", "restore") | ("POST", "rollback") => "restore",
        ("POST", "validate") | ("POST", "verify") | ("POST", "check") => "validate",
        ("GET", _) | ("HEAD", _) => "read",
        ("POST", _) => "create",
        ("PUT", _) | ("PATCH", _) => "update",
        ("DELETE", _) => "delete",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_follow_method_and_suffix() {
        assert_eq!(audit_verb("POST", "/api/v1/safety/approvals/apr-1/approve"), "approve");
        assert_eq!(audit_verb("GET", "/api/v1/sessions"), "read");
        assert_eq!(audit_verb("POST", "/api/v1/sessions"), "create");
        assert_eq!(audit_verb("DELETE", "/api/v1/jobs/job-1"), "delete");
        assert_eq!(audit_verb("PUT", "/api/v1/policy"), "update");
    }

    #[test]
    fn limit_is_clamped() {
        let mut filter = AuditFilter::default();
        assert_eq!(filter.effective_limit(), DEFAULT_QUERY_LIMIT);
        filter.limit = Some(50_000);
        assert_eq!(filter.effective_limit(), MAX_QUERY_LIMIT);
    }
}
