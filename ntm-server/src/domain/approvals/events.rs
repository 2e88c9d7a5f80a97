use super::aggregate::{Approval, ApprovalStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalEventKind {
    Requested,
    Approved,
    Denied,
    Expired,
}

impl ApprovalEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            ApprovalEventKind::Requested => "approval.requested",
            ApprovalEventKind::Approved => "approval.approved",
            ApprovalEventKind::Denied => "approval.denied",
            ApprovalEventKind::Expired => "approval.expired",
        }
    }

    pub fn for_status(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::Pending => ApprovalEventKind::Requested,
            ApprovalStatus::Approved => ApprovalEventKind::Approved,
            ApprovalStatus::Denied => ApprovalEventKind::Denied,
            ApprovalStatus::Expired => ApprovalEventKind::Expired,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApprovalEvent {
    pub kind: ApprovalEventKind,
    pub approval: Approval,
}

impl ApprovalEvent {
    pub fn from_state(approval: &Approval) -> Self {
        Self {
            kind: ApprovalEventKind::for_status(approval.status),
            approval: approval.clone(),
        }
    }
}
