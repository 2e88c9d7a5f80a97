pub mod aggregate;
pub mod events;

pub use aggregate::{Approval, ApprovalStatus, DecisionError};
pub use events::{ApprovalEvent, ApprovalEventKind};
