pub mod accounts;
pub mod approvals;
pub mod audit;
pub mod auth;
pub mod events;
pub mod hub;
pub mod idempotency;
pub mod integrations;
pub mod jobs;
pub mod redaction;
pub mod registry;
pub mod safety;
pub mod sse;
pub mod streams;
pub mod tasks;
