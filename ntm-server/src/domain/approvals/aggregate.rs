use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(format!("unknown approval status '{other}'")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("approval is {0}, not pending")]
    NotPending(ApprovalStatus),
    #[error("approval requires a second person: requestor cannot decide their own request")]
    SelfApproval,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub action: String,
    pub resource: String,
    pub requestor: String,
    pub reason: String,
    pub slb_required: bool,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
}

impl Approval {
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        id: String,
        action: String,
        resource: String,
        requestor: String,
        reason: String,
        slb_required: bool,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id,
            action,
            resource,
            requestor,
            reason,
            slb_required,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
            approver: None,
            approved_at: None,
            decision_reason: None,
        }
    }

    /// Moves a pending approval past its deadline to `Expired`.
    /// Returns true when the transition happened.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ApprovalStatus::Pending && now >= self.expires_at {
            self.status = ApprovalStatus::Expired;
            true
        } else {
            false
        }
    }

    pub fn approve(&mut self, approver: &str, now: DateTime<Utc>) -> Result<(), DecisionError> {
        self.decide(ApprovalStatus::Approved, approver, None, now)
    }

    pub fn deny(
        &mut self,
        approver: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DecisionError> {
        self.decide(ApprovalStatus::Denied, approver, reason, now)
    }

    fn decide(
        &mut self,
        outcome: ApprovalStatus,
        approver: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DecisionError> {
        self.expire_if_due(now);
        if self.status != ApprovalStatus::Pending {
            return Err(DecisionError::NotPending(self.status));
        }
        if self.slb_required && approver == self.requestor {
            return Err(DecisionError::SelfApproval);
        }
        self.status = outcome;
        self.approver = Some(approver.to_string());
        self.approved_at = Some(now);
        self.decision_reason = reason;
        Ok(())
    }

    /// An approved record authorizes `action` until it expires.
    pub fn authorizes(&self, action: &str, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Approved && self.action == action && now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(slb: bool) -> (Approval, DateTime<Utc>) {
        let now = Utc::now();
        let approval = Approval::pending(
            "apr-1".into(),
            "force_release".into(),
            "src/lib.rs".into(),
            "alice".into(),
            "needs release".into(),
            slb,
            now,
            Duration::seconds(3600),
        );
        (approval, now)
    }

    #[test]
    fn slb_blocks_self_approval_without_mutation() {
        let (mut approval, now) = sample(true);
        let before = approval.clone();
        assert_eq!(
            approval.approve("alice", now),
            Err(DecisionError::SelfApproval)
        );
        assert_eq!(approval, before);
        approval.approve("bob", now).unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(approval.approver.as_deref(), Some("bob"));
    }

    #[test]
    fn only_one_decision_leaves_pending() {
        let (mut approval, now) = sample(false);
        approval.deny("bob", Some("no".into()), now).unwrap();
        assert_eq!(
            approval.approve("carol", now),
            Err(DecisionError::NotPending(ApprovalStatus::Denied))
        );
    }

    #[test]
    fn expiry_is_applied_before_decisions() {
        let (mut approval, now) = sample(false);
        let later = now + Duration::seconds(3601);
        assert_eq!(
            approval.approve("bob", later),
            Err(DecisionError::NotPending(ApprovalStatus::Expired))
        );
        assert_eq!(approval.status, ApprovalStatus::Expired);
        assert!(!approval.expire_if_due(later));
    }

    #[test]
    fn authorizes_matching_action_only() {
        let (mut approval, now) = sample(false);
        approval.approve("bob", now).unwrap();
        assert!(approval.authorizes("force_release", now));
        assert!(!approval.authorizes("session.kill", now));
        assert!(!approval.authorizes("force_release", now + Duration::seconds(7200)));
    }
}
