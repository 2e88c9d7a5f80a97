//! The command registry: one entry per REST operation. The router binds
//! handlers from it and the OpenAPI document is rendered from it, so the
//! documented paths are the served paths.

use crate::domain::rbac::{Identity, Permissions, Role};
use serde::Serialize;

pub const API_PREFIX: &str = "/api/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    pub fn openapi_key(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
            Method::Put => "put",
            Method::Delete => "delete",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Caution,
    Dangerous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Permission(Permissions),
    /// Minimum role, by name.
    Role(&'static str),
}

impl Access {
    pub fn allows(&self, identity: &Identity) -> bool {
        match self {
            Access::Permission(bit) => identity.has(*bit),
            Access::Role(name) => identity.role.at_least(&Role::parse(name)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Access::Permission(bit) => bit.names().join(","),
            Access::Role(name) => format!("role:{name}"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub method: Method,
    pub path: &'static str,
    pub input: Option<&'static str>,
    pub output: &'static str,
    pub example: Option<&'static str>,
    pub safety: SafetyLevel,
    pub idempotent: bool,
    pub emits: &'static [&'static str],
    pub access: Access,
}

impl CommandSpec {
    const fn new(
        name: &'static str,
        category: &'static str,
        method: Method,
        path: &'static str,
        description: &'static str,
        access: Permissions,
    ) -> Self {
        Self {
            name,
            category,
            description,
            method,
            path,
            input: None,
            output: "SuccessResponse",
            example: None,
            safety: SafetyLevel::Safe,
            idempotent: matches!(method, Method::Get),
            emits: &[],
            access: Access::Permission(access),
        }
    }

    const fn input(mut self, schema: &'static str) -> Self {
        self.input = Some(schema);
        self
    }

    const fn output(mut self, schema: &'static str) -> Self {
        self.output = schema;
        self
    }

    const fn example(mut self, body: &'static str) -> Self {
        self.example = Some(body);
        self
    }

    const fn caution(mut self) -> Self {
        self.safety = SafetyLevel::Caution;
        self
    }

    const fn dangerous(mut self) -> Self {
        self.safety = SafetyLevel::Dangerous;
        self
    }

    const fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    const fn emits(mut self, events: &'static [&'static str]) -> Self {
        self.emits = events;
        self
    }

    const fn role(mut self, role: &'static str) -> Self {
        self.access = Access::Role(role);
        self
    }

    /// The served path, with the API prefix applied.
    pub fn full_path(&self) -> String {
        if self.path.starts_with("/api/") {
            self.path.to_string()
        } else {
            format!("{API_PREFIX}{}", self.path)
        }
    }

    /// `{name}` segments in order of appearance.
    pub fn path_params(&self) -> Vec<&'static str> {
        self.path
            .split('/')
            .filter_map(|segment| segment.strip_prefix('{')?.strip_suffix('}'))
            .collect()
    }

    pub fn operation_id(&self) -> String {
        self.name.replace('.', "_")
    }
}

use Method::{Delete, Get, Post, Put};
type P = Permissions;

pub static COMMANDS: &[CommandSpec] = &[
    // sessions
    CommandSpec::new("sessions.list", "sessions", Get, "/sessions", "List multiplexer sessions", P::READ_SESSIONS),
    CommandSpec::new("sessions.create", "sessions", Post, "/sessions", "Create a session and spawn its agents", P::WRITE_SESSIONS)
        .input("SessionCreateRequest")
        .example(r#"{"name":"proj","agents":{"cc":2,"cod":1}}"#)
        .caution()
        .idempotent()
        .emits(&["session.created"]),
    CommandSpec::new("sessions.get", "sessions", Get, "/sessions/{id}", "Describe one session", P::READ_SESSIONS),
    CommandSpec::new("sessions.kill", "sessions", Delete, "/sessions/{id}", "Kill a session and its panes", P::WRITE_SESSIONS)
        .dangerous()
        .emits(&["session.killed"]),
    CommandSpec::new("sessions.status", "sessions", Get, "/sessions/{id}/status", "Session status with per-pane agent state", P::READ_SESSIONS),
    CommandSpec::new("sessions.attach", "sessions", Post, "/sessions/{id}/attach", "Prepare an attach command for a session", P::WRITE_SESSIONS),
    CommandSpec::new("sessions.view", "sessions", Post, "/sessions/{id}/view", "Tile all panes of a session", P::WRITE_SESSIONS),
    CommandSpec::new("sessions.zoom", "sessions", Post, "/sessions/{id}/zoom", "Zoom one pane of a session", P::WRITE_SESSIONS)
        .input("PaneRef"),
    CommandSpec::new("sessions.events", "sessions", Get, "/sessions/{id}/events", "Replay events recorded for a session", P::READ_EVENTS)
        .output("EventList"),
    CommandSpec::new("sessions.agents", "agents", Get, "/sessions/{id}/agents", "List agents running in a session", P::READ_AGENTS),
    // panes
    CommandSpec::new("panes.list", "panes", Get, "/sessions/{id}/panes", "List panes of a session", P::READ_SESSIONS),
    CommandSpec::new("panes.output", "panes", Get, "/sessions/{id}/panes/{idx}/output", "Capture recent pane output", P::READ_SESSIONS),
    CommandSpec::new("panes.input", "panes", Post, "/sessions/{id}/panes/{idx}/input", "Send keystrokes to a pane", P::WRITE_SESSIONS)
        .input("PaneInput")
        .example(r#"{"text":"cargo test","enter":true}"#)
        .caution()
        .emits(&["pane.input"]),
    CommandSpec::new("panes.title.get", "panes", Get, "/sessions/{id}/panes/{idx}/title", "Read a pane title", P::READ_SESSIONS),
    CommandSpec::new("panes.title.set", "panes", Put, "/sessions/{id}/panes/{idx}/title", "Set a pane title", P::WRITE_SESSIONS)
        .input("PaneTitle")
        .idempotent(),
    CommandSpec::new("panes.interrupt", "panes", Post, "/sessions/{id}/panes/{idx}/interrupt", "Send Ctrl-C to a pane", P::WRITE_SESSIONS)
        .caution(),
    CommandSpec::new("panes.stream.start", "panes", Post, "/sessions/{id}/panes/{idx}/stream", "Start streaming pane output as events", P::READ_SESSIONS)
        .input("StreamRequest")
        .emits(&["pane.output"]),
    CommandSpec::new("panes.stream.stop", "panes", Delete, "/sessions/{id}/panes/{idx}/stream", "Stop a pane output stream", P::READ_SESSIONS),
    // agents
    CommandSpec::new("agents.send", "agents", Post, "/sessions/{id}/agents/send", "Send a prompt to agents in a session", P::WRITE_AGENTS)
        .input("AgentSend")
        .example(r#"{"message":"run the tests","type":"cc"}"#)
        .caution()
        .emits(&["agent.prompted"]),
    CommandSpec::new("agents.interrupt", "agents", Post, "/sessions/{id}/agents/interrupt", "Interrupt agents in a session", P::WRITE_AGENTS)
        .caution(),
    CommandSpec::new("agents.wait", "agents", Get, "/sessions/{id}/agents/wait", "Wait until agents reach a condition", P::READ_AGENTS),
    CommandSpec::new("agents.route", "agents", Get, "/sessions/{id}/agents/route", "Pick the best agent for new work", P::READ_AGENTS),
    CommandSpec::new("agents.activity", "agents", Get, "/sessions/{id}/agents/activity", "Per-agent activity state", P::READ_AGENTS),
    CommandSpec::new("agents.health", "agents", Get, "/sessions/{id}/agents/health", "Per-agent health checks", P::READ_AGENTS),
    CommandSpec::new("agents.context", "agents", Get, "/sessions/{id}/agents/context", "Context window usage per agent", P::READ_AGENTS),
    CommandSpec::new("agents.restart", "agents", Post, "/sessions/{id}/agents/restart", "Restart agents in a session", P::WRITE_AGENTS)
        .caution()
        .emits(&["agent.restarted"]),
    CommandSpec::new("agents.spawn", "agents", Post, "/sessions/{id}/agents/spawn", "Add agents to a session", P::WRITE_AGENTS)
        .input("AgentSpawn")
        .emits(&["agent.spawned"]),
    // history and output
    CommandSpec::new("history.list", "history", Get, "/history", "Prompt history for a session", P::READ_SESSIONS),
    CommandSpec::new("output.get", "history", Get, "/output/{kind}", "Output tail, diff, touched files or summary", P::READ_SESSIONS),
    // safety
    CommandSpec::new("safety.status", "safety", Get, "/safety/status", "Wrapper installation and policy status", P::READ_SAFETY)
        .output("SafetyStatus"),
    CommandSpec::new("safety.blocked", "safety", Get, "/safety/blocked", "Commands blocked by the wrappers", P::READ_SAFETY),
    CommandSpec::new("safety.check", "safety", Post, "/safety/check", "Evaluate a command against the policy", P::READ_SAFETY)
        .input("CommandCheck")
        .example(r#"{"command":"git push --force"}"#),
    CommandSpec::new("safety.install", "safety", Post, "/safety/install", "Install the git/rm wrappers and the pre-tool hook", P::WRITE_SAFETY)
        .input("InstallRequest")
        .caution()
        .emits(&["safety.installed"]),
    CommandSpec::new("safety.uninstall", "safety", Post, "/safety/uninstall", "Remove unmodified wrappers and hook", P::WRITE_SAFETY)
        .dangerous()
        .emits(&["safety.uninstalled"]),
    CommandSpec::new("safety.redaction", "safety", Get, "/safety/redaction", "Recent redaction summaries", P::READ_SAFETY),
    // policy
    CommandSpec::new("policy.get", "policy", Get, "/policy", "Current safety policy", P::READ_SAFETY),
    CommandSpec::new("policy.update", "policy", Put, "/policy", "Replace the safety policy", P::WRITE_SAFETY)
        .input("PolicyContent")
        .caution()
        .idempotent()
        .emits(&["policy.updated"]),
    CommandSpec::new("policy.validate", "policy", Post, "/policy/validate", "Validate policy YAML without saving", P::READ_SAFETY)
        .input("PolicyContent")
        .output("ValidationReport")
        .example("{\"content\":\"version: 1\\nblocked: []\\n\"}")
        .idempotent(),
    CommandSpec::new("policy.reset", "policy", Post, "/policy/reset", "Restore the built-in policy", P::WRITE_SAFETY)
        .role("admin")
        .dangerous()
        .emits(&["policy.updated"]),
    CommandSpec::new("policy.automation.get", "policy", Get, "/policy/automation", "Automation settings", P::READ_SAFETY),
    CommandSpec::new("policy.automation.update", "policy", Put, "/policy/automation", "Change automation settings", P::WRITE_SAFETY)
        .input("Automation")
        .idempotent()
        .emits(&["policy.updated"]),
    // approvals
    CommandSpec::new("approvals.list", "approvals", Get, "/safety/approvals", "List approvals", P::READ_APPROVALS),
    CommandSpec::new("approvals.history", "approvals", Get, "/safety/approvals/history", "Decided approvals, newest first", P::READ_APPROVALS),
    CommandSpec::new("approvals.get", "approvals", Get, "/safety/approvals/{id}", "One approval", P::READ_APPROVALS)
        .output("Approval"),
    CommandSpec::new("approvals.request", "approvals", Post, "/safety/approvals/request", "Request approval for an action", P::REQUEST_APPROVALS)
        .input("ApprovalRequest")
        .output("Approval")
        .example(r#"{"action":"git push --force","resource":"main"}"#)
        .emits(&["approval.requested"]),
    CommandSpec::new("approvals.approve", "approvals", Post, "/safety/approvals/{id}/approve", "Approve a pending request", P::APPROVE_REQUESTS)
        .output("Approval")
        .emits(&["approval.approved"]),
    CommandSpec::new("approvals.deny", "approvals", Post, "/safety/approvals/{id}/deny", "Deny a pending request", P::APPROVE_REQUESTS)
        .input("ApprovalDecision")
        .output("Approval")
        .emits(&["approval.denied"]),
    // checkpoints
    CommandSpec::new("checkpoints.list", "checkpoints", Get, "/sessions/{id}/checkpoints", "List checkpoints of a session", P::READ_CHECKPOINTS),
    CommandSpec::new("checkpoints.get", "checkpoints", Get, "/sessions/{id}/checkpoints/{cid}", "Checkpoint metadata", P::READ_CHECKPOINTS),
    CommandSpec::new("checkpoints.delete", "checkpoints", Delete, "/sessions/{id}/checkpoints/{cid}", "Delete a checkpoint", P::WRITE_CHECKPOINTS)
        .caution()
        .emits(&["checkpoint.deleted"]),
    CommandSpec::new("checkpoints.download", "checkpoints", Get, "/sessions/{id}/checkpoints/{cid}/export", "Download a checkpoint archive", P::READ_CHECKPOINTS)
        .output("Archive"),
    CommandSpec::new("checkpoints.export", "checkpoints", Post, "/sessions/{id}/checkpoints/{cid}/export", "Export a checkpoint to an archive", P::WRITE_CHECKPOINTS)
        .input("ExportRequest")
        .emits(&["checkpoint.exported"]),
    CommandSpec::new("checkpoints.import", "checkpoints", Post, "/checkpoints/import", "Import a checkpoint archive", P::WRITE_CHECKPOINTS)
        .input("ImportRequest")
        .caution()
        .emits(&["checkpoint.imported"]),
    CommandSpec::new("checkpoints.verify", "checkpoints", Post, "/sessions/{id}/checkpoints/{cid}/verify", "Verify checkpoint checksums", P::READ_CHECKPOINTS),
    CommandSpec::new("checkpoints.rollback", "checkpoints", Post, "/sessions/{id}/checkpoints/{cid}/rollback", "Roll the working tree back to a checkpoint", P::WRITE_CHECKPOINTS)
        .input("RollbackRequest")
        .dangerous()
        .emits(&["checkpoint.rolled_back"]),
    CommandSpec::new("checkpoints.restore", "checkpoints", Post, "/sessions/{id}/checkpoints/{cid}/restore", "Recreate a session from a checkpoint", P::WRITE_CHECKPOINTS)
        .input("RestoreRequest")
        .dangerous()
        .emits(&["checkpoint.restored"]),
    // pipelines
    CommandSpec::new("pipelines.list", "pipelines", Get, "/pipelines", "List pipeline runs", P::READ_PIPELINES),
    CommandSpec::new("pipelines.templates", "pipelines", Get, "/pipelines/templates", "List workflow templates", P::READ_PIPELINES),
    CommandSpec::new("pipelines.get", "pipelines", Get, "/pipelines/{id}", "One pipeline run", P::READ_PIPELINES),
    CommandSpec::new("pipelines.exec", "pipelines", Post, "/pipelines/exec", "Run an ad-hoc stage list", P::WRITE_PIPELINES)
        .input("PipelineExec")
        .caution()
        .emits(&["pipeline.started"]),
    CommandSpec::new("pipelines.run", "pipelines", Post, "/pipelines/run", "Run a workflow file or template", P::WRITE_PIPELINES)
        .input("PipelineRun")
        .caution()
        .emits(&["pipeline.started"]),
    CommandSpec::new("pipelines.validate", "pipelines", Post, "/pipelines/validate", "Validate a workflow", P::READ_PIPELINES)
        .input("PipelineRun")
        .idempotent(),
    CommandSpec::new("pipelines.resume", "pipelines", Post, "/pipelines/{id}/resume", "Resume a stopped run", P::WRITE_PIPELINES)
        .emits(&["pipeline.resumed"]),
    CommandSpec::new("pipelines.cancel", "pipelines", Post, "/pipelines/{id}/cancel", "Cancel a run", P::WRITE_PIPELINES)
        .emits(&["pipeline.cancelled"]),
    CommandSpec::new("pipelines.cleanup", "pipelines", Post, "/pipelines/cleanup", "Remove finished run state", P::WRITE_PIPELINES)
        .caution(),
    // jobs
    CommandSpec::new("jobs.list", "jobs", Get, "/jobs", "List background jobs", P::READ_JOBS),
    CommandSpec::new("jobs.create", "jobs", Post, "/jobs", "Start a background job", P::WRITE_JOBS)
        .input("JobRequest")
        .output("Job")
        .example(r#"{"type":"checkpoint","session":"proj","params":{"name":"pre-merge"}}"#)
        .emits(&["job.created", "job.started", "job.completed", "job.failed"]),
    CommandSpec::new("jobs.get", "jobs", Get, "/jobs/{id}", "One job", P::READ_JOBS)
        .output("Job"),
    CommandSpec::new("jobs.cancel", "jobs", Delete, "/jobs/{id}", "Cancel a pending or running job", P::WRITE_JOBS)
        .output("Job")
        .emits(&["job.cancelled"]),
    // system
    CommandSpec::new("system.config", "system", Get, "/config", "Effective server configuration", P::SYSTEM_CONFIG),
    CommandSpec::new("deps.list", "system", Get, "/deps", "External tool availability", P::READ_HEALTH),
    CommandSpec::new("deps.refresh", "system", Post, "/deps/refresh", "Re-scan PATH for external tools", P::SYSTEM_CONFIG)
        .idempotent(),
    CommandSpec::new("system.health", "system", Get, "/health", "Liveness and component status", P::READ_HEALTH),
    CommandSpec::new("audit.query", "system", Get, "/audit", "Query the audit index", P::READ_AUDIT),
    CommandSpec::new("events.replay", "system", Get, "/events/replay", "Replay stored events after a sequence", P::READ_EVENTS)
        .output("EventList"),
    CommandSpec::new("events.dropped", "system", Get, "/events/dropped", "Events not delivered to slow clients", P::READ_EVENTS),
    // memory
    CommandSpec::new("memory.context", "memory", Get, "/memory/context", "Relevant memories for a task", P::READ_INTEGRATIONS),
    CommandSpec::new("memory.daemon", "memory", Get, "/memory/daemon", "Memory daemon liveness for a session", P::READ_INTEGRATIONS),
    // beads
    CommandSpec::new("beads.list", "beads", Get, "/beads", "List beads", P::READ_INTEGRATIONS),
    CommandSpec::new("beads.ready", "beads", Get, "/beads/ready", "Beads ready to work on", P::READ_INTEGRATIONS),
    CommandSpec::new("beads.get", "beads", Get, "/beads/{id}", "One bead", P::READ_INTEGRATIONS),
    CommandSpec::new("beads.create", "beads", Post, "/beads", "Create a bead", P::WRITE_INTEGRATIONS)
        .input("BeadCreate")
        .example(r#"{"title":"Fix flaky test","priority":1}"#),
    CommandSpec::new("beads.close", "beads", Post, "/beads/{id}/close", "Close a bead", P::WRITE_INTEGRATIONS),
    // cass
    CommandSpec::new("cass.search", "cass", Get, "/cass/search", "Search past agent sessions", P::READ_INTEGRATIONS),
    CommandSpec::new("cass.status", "cass", Get, "/cass/status", "Search index status", P::READ_INTEGRATIONS),
    // accounts
    CommandSpec::new("accounts.list", "accounts", Get, "/accounts", "Configured agent accounts", P::READ_INTEGRATIONS),
    CommandSpec::new("accounts.status", "accounts", Get, "/accounts/status", "Active account per provider", P::READ_INTEGRATIONS),
    CommandSpec::new("accounts.rotate", "accounts", Post, "/accounts/rotate", "Switch to another account", P::WRITE_INTEGRATIONS)
        .input("RotateRequest")
        .caution()
        .emits(&["account.rotated"]),
    CommandSpec::new("accounts.history", "accounts", Get, "/accounts/history", "Rotations performed by this server", P::READ_INTEGRATIONS),
    // scanner
    CommandSpec::new("scanner.run", "scanner", Post, "/scanner/run", "Run the bug scanner", P::WRITE_INTEGRATIONS)
        .input("ScanRequest")
        .emits(&["scan.completed"]),
    CommandSpec::new("scanner.status", "scanner", Get, "/scanner/status", "Scanner availability and last result", P::READ_INTEGRATIONS),
    // mail
    CommandSpec::new("mail.inbox", "mail", Get, "/mail/inbox", "Fetch an agent inbox", P::READ_INTEGRATIONS),
    CommandSpec::new("mail.send", "mail", Post, "/mail/send", "Send a message between agents", P::WRITE_INTEGRATIONS)
        .input("MailSend"),
    CommandSpec::new("mail.reservations.list", "mail", Get, "/mail/reservations", "Active file reservations", P::READ_INTEGRATIONS),
    CommandSpec::new("mail.reservations.create", "mail", Post, "/mail/reservations", "Reserve paths for an agent", P::WRITE_INTEGRATIONS)
        .input("Reservation"),
    CommandSpec::new("mail.reservations.release", "mail", Delete, "/mail/reservations/{id}", "Release a reservation", P::WRITE_INTEGRATIONS)
        .caution(),
];

pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}
