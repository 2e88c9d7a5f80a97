pub mod approvals;
pub mod audit;
pub mod events;
pub mod policy;
pub mod rbac;
