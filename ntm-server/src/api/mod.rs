//! HTTP surface. Every REST route comes from the command registry; the
//! middleware stack wraps them outermost first:
//! request context → CORS → redaction → authentication → idempotency →
//! audit → per-route access check → handler.

pub mod audit;
pub mod auth;
pub mod context;
pub mod docs;
pub mod envelope;
pub mod extract;
pub mod handlers;
pub mod idempotency;
pub mod openapi;
pub mod redaction;
pub mod sse;
pub mod ws;

use crate::app::registry::{Access, CommandSpec, Method, API_PREFIX, COMMANDS};
use crate::AppState;
use axum::extract::Request;
use axum::http::{HeaderValue, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, MethodFilter, MethodRouter};
use axum::Router;
use envelope::ApiError;
use handlers::{
    agents, approvals, checkpoints, history, integrations, jobs, panes, pipelines, safety, sessions, system,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

pub const WS_PATH: &str = "/ws";
pub const SSE_PATH: &str = "/events";

/// The full application router, state applied.
pub fn router(state: AppState) -> Router {
    let features = state.settings.features;

    let mut protected = Router::new();
    for spec in COMMANDS {
        match bind(spec) {
            Some(handler) => {
                protected = protected.route(&axum_path(&spec.full_path()), guarded(handler, spec.access));
            }
            None => warn!(command = spec.name, "command has no handler"),
        }
    }
    if features.ws {
        protected = protected.route(WS_PATH, guarded(get(ws::upgrade), stream_access()));
    }
    if features.sse {
        protected = protected.route(SSE_PATH, guarded(get(sse::events), stream_access()));
    }
    let protected = protected
        .layer(middleware::from_fn_with_state(state.clone(), audit::audit))
        .layer(middleware::from_fn_with_state(state.clone(), idempotency::idempotency))
        .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate));

    let mut app = protected;
    if features.openapi {
        app = app.merge(
            Router::new()
                .route(&format!("{API_PREFIX}/openapi.json"), get(docs::openapi_json))
                .route(&format!("{API_PREFIX}/docs"), get(docs::docs)),
        );
    }

    app.fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), redaction::redact))
        .layer(cors(&state.settings.cors_origins))
        .layer(middleware::from_fn(context::request_context))
        .with_state(state)
}

fn stream_access() -> Access {
    Access::Permission(crate::domain::rbac::Permissions::READ_EVENTS)
}

fn guarded(handler: MethodRouter<AppState>, access: Access) -> MethodRouter<AppState> {
    handler.route_layer(middleware::from_fn(move |req: Request, next: Next| {
        auth::require_access(access, req, next)
    }))
}

/// `/sessions/{id}` → `/sessions/:id`.
pub fn axum_path(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(param) => format!(":{param}"),
            None => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn filter(method: Method) -> MethodFilter {
    match method {
        Method::Get => MethodFilter::GET,
        Method::Post => MethodFilter::POST,
        Method::Put => MethodFilter::PUT,
        Method::Delete => MethodFilter::DELETE,
    }
}

/// The handler for a registry entry.
fn bind(spec: &CommandSpec) -> Option<MethodRouter<AppState>> {
    let m = filter(spec.method);
    let handler = match spec.name {
        "sessions.list" => on(m, sessions::list),
        "sessions.create" => on(m, sessions::create),
        "sessions.get" => on(m, sessions::get),
        "sessions.kill" => on(m, sessions::kill),
        "sessions.status" => on(m, sessions::status),
        "sessions.attach" => on(m, sessions::attach),
        "sessions.view" => on(m, sessions::view),
        "sessions.zoom" => on(m, sessions::zoom),
        "sessions.events" => on(m, sessions::events),
        "sessions.agents" => on(m, sessions::agents),

        "panes.list" => on(m, panes::list),
        "panes.output" => on(m, panes::output),
        "panes.input" => on(m, panes::input),
        "panes.title.get" => on(m, panes::title_get),
        "panes.title.set" => on(m, panes::title_set),
        "panes.interrupt" => on(m, panes::interrupt),
        "panes.stream.start" => on(m, panes::stream_start),
        "panes.stream.stop" => on(m, panes::stream_stop),

        "agents.send" => on(m, agents::send),
        "agents.interrupt" => on(m, agents::interrupt),
        "agents.wait" => on(m, agents::wait),
        "agents.route" => on(m, agents::route),
        "agents.activity" => on(m, agents::activity),
        "agents.health" => on(m, agents::health),
        "agents.context" => on(m, agents::context),
        "agents.restart" => on(m, agents::restart),
        "agents.spawn" => on(m, agents::spawn),

        "history.list" => on(m, history::list),
        "output.get" => on(m, history::output),

        "safety.status" => on(m, safety::status),
        "safety.blocked" => on(m, safety::blocked),
        "safety.check" => on(m, safety::check),
        "safety.install" => on(m, safety::install),
        "safety.uninstall" => on(m, safety::uninstall),
        "safety.redaction" => on(m, safety::redaction),
        "policy.get" => on(m, safety::policy_get),
        "policy.update" => on(m, safety::policy_update),
        "policy.validate" => on(m, safety::policy_validate),
        "policy.reset" => on(m, safety::policy_reset),
        "policy.automation.get" => on(m, safety::automation_get),
        "policy.automation.update" => on(m, safety::automation_update),

        "approvals.list" => on(m, approvals::list),
        "approvals.history" => on(m, approvals::history),
        "approvals.get" => on(m, approvals::get),
        "approvals.request" => on(m, approvals::request),
        "approvals.approve" => on(m, approvals::approve),
        "approvals.deny" => on(m, approvals::deny),

        "checkpoints.list" => on(m, checkpoints::list),
        "checkpoints.get" => on(m, checkpoints::get),
        "checkpoints.delete" => on(m, checkpoints::delete),
        "checkpoints.download" => on(m, checkpoints::download),
        "checkpoints.export" => on(m, checkpoints::export),
        "checkpoints.import" => on(m, checkpoints::import),
        "checkpoints.verify" => on(m, checkpoints::verify),
        "checkpoints.rollback" => on(m, checkpoints::rollback),
        "checkpoints.restore" => on(m, checkpoints::restore),

        "pipelines.list" => on(m, pipelines::list),
        "pipelines.templates" => on(m, pipelines::templates),
        "pipelines.get" => on(m, pipelines::get),
        "pipelines.exec" => on(m, pipelines::exec),
        "pipelines.run" => on(m, pipelines::run),
        "pipelines.validate" => on(m, pipelines::validate),
        "pipelines.resume" => on(m, pipelines::resume),
        "pipelines.cancel" => on(m, pipelines::cancel),
        "pipelines.cleanup" => on(m, pipelines::cleanup),

        "jobs.list" => on(m, jobs::list),
        "jobs.create" => on(m, jobs::create),
        "jobs.get" => on(m, jobs::get),
        "jobs.cancel" => on(m, jobs::cancel),

        "system.config" => on(m, system::config),
        "deps.list" => on(m, system::deps),
        "deps.refresh" => on(m, system::deps_refresh),
        "system.health" => on(m, system::health),
        "audit.query" => on(m, system::audit),
        "events.replay" => on(m, system::events_replay),
        "events.dropped" => on(m, system::events_dropped),

        "memory.context" => on(m, integrations::memory_context),
        "memory.daemon" => on(m, integrations::memory_daemon),
        "beads.list" => on(m, integrations::beads_list),
        "beads.ready" => on(m, integrations::beads_ready),
        "beads.get" => on(m, integrations::beads_get),
        "beads.create" => on(m, integrations::beads_create),
        "beads.close" => on(m, integrations::beads_close),
        "cass.search" => on(m, integrations::cass_search),
        "cass.status" => on(m, integrations::cass_status),
        "accounts.list" => on(m, integrations::accounts_list),
        "accounts.status" => on(m, integrations::accounts_status),
        "accounts.rotate" => on(m, integrations::accounts_rotate),
        "accounts.history" => on(m, integrations::accounts_history),
        "scanner.run" => on(m, integrations::scanner_run),
        "scanner.status" => on(m, integrations::scanner_status),
        "mail.inbox" => on(m, integrations::mail_inbox),
        "mail.send" => on(m, integrations::mail_send),
        "mail.reservations.list" => on(m, integrations::mail_reservations),
        "mail.reservations.create" => on(m, integrations::mail_reserve),
        "mail.reservations.release" => on(m, integrations::mail_release),
        _ => return None,
    };
    Some(handler)
}

fn cors(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([context::X_REQUEST_ID.clone()]);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn not_found(method: axum::http::Method, uri: Uri) -> Response {
    ApiError::not_found(format!("no route for {method} {}", uri.path())).into_response()
}
