use crate::app::events::EventBus;
use crate::app::safety::PolicyStore;
use crate::domain::approvals::{Approval, ApprovalEvent, ApprovalStatus, DecisionError};
use crate::domain::events::topics;
use crate::telemetry::ServerMetrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error("approval {id} does not authorize {action}")]
    NotAuthorized { id: String, action: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default)]
pub struct NewApproval {
    pub action: String,
    pub resource: String,
    pub reason: String,
    pub requestor: String,
}

/// In-memory approval workflow. Records are discarded on restart.
pub struct ApprovalService {
    approvals: RwLock<HashMap<String, Approval>>,
    next_id: AtomicU64,
    ttl: chrono::Duration,
    policy: Arc<PolicyStore>,
    bus: Arc<EventBus>,
    metrics: Option<Arc<ServerMetrics>>,
}

impl ApprovalService {
    pub fn new(
        policy: Arc<PolicyStore>,
        bus: Arc<EventBus>,
        ttl: Duration,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_APPROVAL_TTL } else { ttl };
        Self {
            approvals: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
            policy,
            bus,
            metrics,
        }
    }

    pub fn request(&self, request: NewApproval) -> Result<Approval, ApprovalError> {
        let action = request.action.trim();
        if action.is_empty() {
            return Err(ApprovalError::Invalid("action is required".into()));
        }
        let requestor = request.requestor.trim();
        if requestor.is_empty() {
            return Err(ApprovalError::Invalid("requestor is required".into()));
        }
        let slb_required = self.policy.slb_required(action);
        let id = format!("apr-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let reason = if request.reason.trim().is_empty() {
            self.policy.check(action).reason
        } else {
            request.reason
        };
        let approval = Approval::pending(
            id.clone(),
            action.to_string(),
            request.resource,
            requestor.to_string(),
            reason,
            slb_required,
            Utc::now(),
            self.ttl,
        );
        self.approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), approval.clone());
        info!(approval_id = %id, action = %approval.action, requestor = %approval.requestor, slb_required, "approval requested");
        self.emit(&approval);
        Ok(approval)
    }

    pub fn get(&self, id: &str) -> Result<Approval, ApprovalError> {
        let (approval, expired) = {
            let mut approvals = self.approvals.write().unwrap_or_else(PoisonError::into_inner);
            let approval = approvals
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
            let expired = approval.expire_if_due(Utc::now());
            (approval.clone(), expired)
        };
        if expired {
            self.emit(&approval);
        }
        Ok(approval)
    }

    pub fn approve(&self, id: &str, approver: &str) -> Result<Approval, ApprovalError> {
        self.decide(id, approver, |approval, now| approval.approve(approver, now))
    }

    pub fn deny(
        &self,
        id: &str,
        approver: &str,
        reason: Option<String>,
    ) -> Result<Approval, ApprovalError> {
        self.decide(id, approver, |approval, now| {
            approval.deny(approver, reason.clone(), now)
        })
    }

    fn decide<F>(&self, id: &str, approver: &str, apply: F) -> Result<Approval, ApprovalError>
    where
        F: FnOnce(&mut Approval, DateTime<Utc>) -> Result<(), DecisionError>,
    {
        let now = Utc::now();
        let (result, snapshot, expired) = {
            let mut approvals = self.approvals.write().unwrap_or_else(PoisonError::into_inner);
            let approval = approvals
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
            let expired = approval.expire_if_due(now);
            let result = apply(approval, now);
            (result, approval.clone(), expired)
        };
        if expired {
            self.emit(&snapshot);
        }
        match result {
            Ok(()) => {
                info!(approval_id = %id, approver, status = %snapshot.status, "approval decided");
                if let Some(metrics) = &self.metrics {
                    metrics.record_approval(snapshot.status.as_str());
                }
                self.emit(&snapshot);
                Ok(snapshot)
            }
            Err(err) => {
                warn!(approval_id = %id, approver, %err, "approval decision refused");
                Err(err.into())
            }
        }
    }

    /// Confirms that `id` is approved for `action` and has not expired.
    pub fn verify(&self, id: &str, action: &str) -> Result<Approval, ApprovalError> {
        let approval = self.get(id)?;
        if approval.authorizes(action, Utc::now()) {
            Ok(approval)
        } else {
            Err(ApprovalError::NotAuthorized {
                id: id.to_string(),
                action: action.to_string(),
            })
        }
    }

    pub fn list(&self, status: Option<ApprovalStatus>) -> Vec<Approval> {
        let mut approvals = self.snapshot_all();
        if let Some(status) = status {
            approvals.retain(|approval| approval.status == status);
        }
        approvals.sort_by_key(|approval| id_number(&approval.id));
        approvals
    }

    /// Decided approvals, most recent decision first.
    pub fn history(&self, limit: usize) -> Vec<Approval> {
        let limit = if limit == 0 { 100 } else { limit };
        let mut approvals = self.snapshot_all();
        approvals.retain(|approval| approval.status != ApprovalStatus::Pending);
        approvals.sort_by(|a, b| {
            decided_at(b)
                .cmp(&decided_at(a))
                .then_with(|| id_number(&b.id).cmp(&id_number(&a.id)))
        });
        approvals.truncate(limit);
        approvals
    }

    fn snapshot_all(&self) -> Vec<Approval> {
        let now = Utc::now();
        let (approvals, expired) = {
            let mut guard = self.approvals.write().unwrap_or_else(PoisonError::into_inner);
            let mut expired = Vec::new();
            for approval in guard.values_mut() {
                if approval.expire_if_due(now) {
                    expired.push(approval.clone());
                }
            }
            (guard.values().cloned().collect::<Vec<_>>(), expired)
        };
        for approval in &expired {
            self.emit(approval);
        }
        approvals
    }

    fn emit(&self, approval: &Approval) {
        let event = ApprovalEvent::from_state(approval);
        let data = match serde_json::to_value(&event.approval) {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, approval_id = %approval.id, "failed to encode approval event");
                return;
            }
        };
        let topic = topics::approval(&approval.id);
        self.bus
            .publish_all(&[topic.as_str(), topics::APPROVALS], event.kind.event_type(), data);
    }
}

fn id_number(id: &str) -> u64 {
    id.strip_prefix("apr-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

fn decided_at(approval: &Approval) -> DateTime<Utc> {
    approval.approved_at.unwrap_or(approval.expires_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::{EventStoreConfig, WsEventStore};
    use crate::domain::events::TopicGlob;
    use crate::paths::HomePaths;

    struct Fixture {
        service: ApprovalService,
        store: Arc<WsEventStore>,
        _home: tempfile::TempDir,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let policy = Arc::new(PolicyStore::new(Arc::new(HomePaths::new(home.path()))).unwrap());
        let store = Arc::new(WsEventStore::memory(EventStoreConfig::default()));
        let bus = Arc::new(EventBus::new(store.clone()));
        Fixture {
            service: ApprovalService::new(policy, bus, ttl, None),
            store,
            _home: home,
        }
    }

    fn request(action: &str, requestor: &str) -> NewApproval {
        NewApproval {
            action: action.into(),
            resource: "main".into(),
            reason: String::new(),
            requestor: requestor.into(),
        }
    }

    #[test]
    fn approve_happy_path_then_conflict() {
        let fx = fixture(Duration::ZERO);
        let approval = fx.service.request(request("git push --force", "alice")).unwrap();
        assert_eq!(approval.id, "apr-1");
        assert!(!approval.slb_required);
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(
            (approval.expires_at - approval.created_at).num_seconds(),
            3600
        );

        let approved = fx.service.approve("apr-1", "bob").unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(
            fx.service.approve("apr-1", "bob"),
            Err(ApprovalError::Decision(DecisionError::NotPending(
                ApprovalStatus::Approved
            )))
        );
        assert!(fx.service.verify("apr-1", "git push --force").is_ok());
        assert!(matches!(
            fx.service.verify("apr-1", "rm -rf /"),
            Err(ApprovalError::NotAuthorized { .. })
        ));

        let events = fx
            .store
            .get_since(0, &"approvals".parse::<TopicGlob>().unwrap(), 0)
            .unwrap()
            .events;
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["approval.requested", "approval.approved"]);
        let per_id = fx
            .store
            .get_since(0, &"approvals:apr-1".parse::<TopicGlob>().unwrap(), 0)
            .unwrap();
        assert_eq!(per_id.events.len(), 2);
    }

    #[test]
    fn slb_rule_rejects_self_approval() {
        let fx = fixture(Duration::ZERO);
        let approval = fx.service.request(request("force_release", "alice")).unwrap();
        assert!(approval.slb_required);
        assert_eq!(
            fx.service.approve(&approval.id, "alice"),
            Err(ApprovalError::Decision(DecisionError::SelfApproval))
        );
        assert_eq!(
            fx.service.get(&approval.id).unwrap().status,
            ApprovalStatus::Pending
        );
        assert_eq!(
            fx.service.approve(&approval.id, "bob").unwrap().status,
            ApprovalStatus::Approved
        );
    }

    #[test]
    fn unknown_ids_and_empty_actions() {
        let fx = fixture(Duration::ZERO);
        assert_eq!(
            fx.service.approve("apr-9", "bob"),
            Err(ApprovalError::NotFound("apr-9".into()))
        );
        assert!(matches!(
            fx.service.request(request("  ", "alice")),
            Err(ApprovalError::Invalid(_))
        ));
    }

    #[test]
    fn expired_approvals_are_reported_and_refused() {
        let fx = fixture(Duration::from_millis(1));
        let approval = fx.service.request(request("git rebase -i", "alice")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            fx.service.list(Some(ApprovalStatus::Expired))[0].id,
            approval.id
        );
        assert_eq!(
            fx.service.deny(&approval.id, "bob", None),
            Err(ApprovalError::Decision(DecisionError::NotPending(
                ApprovalStatus::Expired
            )))
        );
        let types: Vec<_> = fx
            .store
            .get_since(0, &"approvals".parse::<TopicGlob>().unwrap(), 0)
            .unwrap()
            .events
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["approval.requested", "approval.expired"]);
    }

    #[test]
    fn list_and_history_ordering() {
        let fx = fixture(Duration::ZERO);
        for _ in 0..11 {
            fx.service.request(request("git commit --amend", "alice")).unwrap();
        }
        fx.service.deny("apr-2", "bob", Some("no".into())).unwrap();
        fx.service.approve("apr-10", "bob").unwrap();

        let pending = fx.service.list(Some(ApprovalStatus::Pending));
        assert_eq!(pending.len(), 9);
        assert_eq!(pending[0].id, "apr-1");
        assert_eq!(pending.last().unwrap().id, "apr-11");

        let history = fx.service.history(10);
        assert_eq!(
            history.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
            vec!["apr-10", "apr-2"]
        );
        assert_eq!(history[1].decision_reason.as_deref(), Some("no"));
        assert_eq!(fx.service.history(1).len(), 1);
    }
}
