//! Authentication, per-route permission checks, and the approval gate for
//! dangerous actions.

use super::context::{RequestContext, RequestId};
use super::envelope::ApiError;
use crate::app::approvals::NewApproval;
use crate::app::auth::Credentials;
use crate::app::registry::Access;
use crate::domain::policy::{ForceRelease, PolicyAction};
use crate::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::net::SocketAddr;
use tracing::{debug, info};

pub const X_API_KEY: &str = "x-api-key";
pub const X_APPROVAL_ID: &str = "x-approval-id";

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// Resolves the caller and attaches a [`RequestContext`]; unauthenticated
/// requests never reach the inner layers.
pub async fn authenticate(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut req: Request,
    next: Next,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let headers = req.headers();
    let creds = Credentials {
        peer: remote_addr.map(|addr| addr.ip()),
        api_key: headers.get(X_API_KEY).and_then(|value| value.to_str().ok()),
        bearer: bearer(headers),
    };

    let identity = match state.auth.authenticate(creds).await {
        Ok(identity) => identity,
        Err(err) => {
            info!(error = %err, remote = ?remote_addr, "authentication failed");
            return ApiError::from(err).into_response();
        }
    };
    debug!(user = %identity.user_id, role = %identity.role, "authenticated");

    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|RequestId(id)| id.clone())
        .unwrap_or_default();
    req.extensions_mut().insert(RequestContext {
        request_id,
        identity,
        remote_addr,
    });
    next.run(req).await
}

/// Route-level guard for one registry entry.
pub async fn require_access(access: Access, req: Request, next: Next) -> Response {
    let Some(ctx) = req.extensions().get::<RequestContext>() else {
        return ApiError::forbidden("no role context").into_response();
    };
    if !access.allows(&ctx.identity) {
        return ApiError::forbidden("insufficient permission")
            .with_details(json!({ "required": access.describe(), "role": ctx.identity.role }))
            .into_response();
    }
    next.run(req).await
}

/// Consults the policy for `action`. Blocked actions are refused, actions
/// needing approval pass only with a valid `X-Approval-Id`; otherwise a
/// pending approval is created and returned inside a 409.
///
/// Returns the approval id that authorized the call, if any.
pub fn approval_gate(
    state: &AppState,
    ctx: &RequestContext,
    headers: &HeaderMap,
    action: &str,
    resource: &str,
) -> Result<Option<String>, ApiError> {
    let decision = state.policy.check(action);
    match decision.action {
        PolicyAction::Allow => Ok(None),
        PolicyAction::Block => Err(ApiError::forbidden(format!(
            "{action} is blocked by policy: {}",
            decision.reason
        ))),
        PolicyAction::Approve => require_approval(state, ctx, headers, action, resource, &decision.reason),
    }
}

/// Force-releasing another agent's reservation follows the policy's
/// automation setting instead of a rule.
pub fn force_release_gate(
    state: &AppState,
    ctx: &RequestContext,
    headers: &HeaderMap,
    resource: &str,
) -> Result<Option<String>, ApiError> {
    match state.policy.automation().force_release {
        ForceRelease::Never => Err(ApiError::forbidden("force release is disabled by policy")),
        ForceRelease::Auto => Ok(None),
        ForceRelease::Approval => require_approval(
            state,
            ctx,
            headers,
            "force_release",
            resource,
            "force release requires approval",
        ),
    }
}

fn require_approval(
    state: &AppState,
    ctx: &RequestContext,
    headers: &HeaderMap,
    action: &str,
    resource: &str,
    reason: &str,
) -> Result<Option<String>, ApiError> {
    if let Some(id) = headers
        .get(X_APPROVAL_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        let approval = state.approvals.verify(id, action)?;
        return Ok(Some(approval.id));
    }

    let approval = state.approvals.request(NewApproval {
        action: action.to_string(),
        resource: resource.to_string(),
        reason: reason.to_string(),
        requestor: ctx.identity.user_id.clone(),
    })?;
    Err(ApiError::approval_required(json!({
        "approval_id": approval.id,
        "action": approval.action,
        "resource": approval.resource,
        "slb_required": approval.slb_required,
        "expires_at": approval.expires_at,
        "message": format!("{action} requires approval"),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_tokens_are_parsed_case_insensitively() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer(&headers), Some("abc.def"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  xyz"));
        assert_eq!(bearer(&headers), Some("xyz"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&headers), None);
    }
}
