use super::validate_name;
use crate::api::auth::approval_gate;
use crate::api::context::RequestContext;
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery, JsonOrDefault};
use crate::domain::events::topics;
use crate::ports::checkpoint_store::{
    CheckpointMeta, ExportFormat, ExportOptions, ExportResult, ImportOptions, RestoreOptions, VerifyReport,
};
use crate::AppState;
use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub details: bool,
}

/// Export knobs shared by the download and the server-side export.
#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default = "yes")]
    pub redact_secrets: bool,
    #[serde(default)]
    pub rewrite_paths: bool,
    #[serde(default = "yes")]
    pub include_scrollback: bool,
    #[serde(default = "yes")]
    pub include_git_patch: bool,
}

impl Default for ExportRequest {
    fn default() -> Self {
        Self {
            format: None,
            redact_secrets: true,
            rewrite_paths: false,
            include_scrollback: true,
            include_git_patch: true,
        }
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    /// The archive, base64-encoded.
    pub data: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub target_session: Option<String>,
    #[serde(default = "yes")]
    pub verify_checksums: bool,
    #[serde(default)]
    pub allow_overwrite: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub no_git: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub target_session: Option<String>,
    #[serde(default)]
    pub skip_git: bool,
}

fn ids<'a>(session: &'a str, cid: &'a str) -> Result<(&'a str, &'a str), ApiError> {
    Ok((validate_name("id", session)?, validate_name("cid", cid)?))
}

fn parse_format(raw: Option<&str>) -> Result<ExportFormat, ApiError> {
    raw.filter(|format| !format.trim().is_empty())
        .map(str::parse::<ExportFormat>)
        .transpose()
        .map_err(|err| ApiError::invalid_field("format", err))
        .map(Option::unwrap_or_default)
}

fn export_options(request: &ExportRequest, output_dir: PathBuf) -> Result<ExportOptions, ApiError> {
    Ok(ExportOptions {
        format: parse_format(request.format.as_deref())?,
        redact_secrets: request.redact_secrets,
        rewrite_paths: request.rewrite_paths,
        include_scrollback: request.include_scrollback,
        include_git_patch: request.include_git_patch,
        output_dir,
    })
}

fn scratch_dir(state: &AppState, kind: &str) -> PathBuf {
    state
        .settings
        .data_dir
        .join(kind)
        .join(Uuid::new_v4().to_string())
}

async fn discard(dir: &PathBuf) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(%err, dir = %dir.display(), "failed to remove scratch directory");
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let checkpoints = state.checkpoints.list(session).await?;
    let listed: Vec<Value> = if query.details {
        checkpoints.iter().map(|meta| json!(meta)).collect()
    } else {
        checkpoints
            .iter()
            .map(|meta| json!({ "id": meta.id, "name": meta.name, "created_at": meta.created_at }))
            .collect()
    };
    ok(json!({ "session": session, "count": listed.len(), "checkpoints": listed }))
}

pub async fn get(
    State(state): State<AppState>,
    ApiPath((id, cid)): ApiPath<(String, String)>,
) -> ApiResult<CheckpointMeta> {
    let (session, cid) = ids(&id, &cid)?;
    ok(state.checkpoints.get(session, cid).await?)
}

pub async fn delete(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiPath((id, cid)): ApiPath<(String, String)>,
) -> ApiResult<Value> {
    let (session, cid) = ids(&id, &cid)?;
    state.checkpoints.delete(session, cid).await?;
    state.bus.publish(
        &topics::checkpoints(session),
        "checkpoint.deleted",
        json!({ "session": session, "checkpoint": cid, "by": ctx.identity.user_id }),
    );
    ok(json!({ "session": session, "checkpoint": cid, "deleted": true }))
}

/// Streams the archive back as the response body.
pub async fn download(
    State(state): State<AppState>,
    ApiPath((id, cid)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<ExportRequest>,
) -> Result<Response, ApiError> {
    let (session, cid) = ids(&id, &cid)?;
    let dir = scratch_dir(&state, "exports");
    let options = export_options(&query, dir.clone())?;
    let exported = state.checkpoints.export(session, cid, &options).await;
    let bytes = match exported {
        Ok(result) => tokio::fs::read(&result.path).await.map_err(|err| {
            ApiError::internal(format!("reading exported archive: {err}"))
        }),
        Err(err) => Err(err.into()),
    };
    discard(&dir).await;
    let bytes = bytes?;

    let filename = format!("{session}-{cid}.{}", options.format.as_str());
    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(options.format.content_type()));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// Writes the archive under the data directory and reports where.
pub async fn export(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiPath((id, cid)): ApiPath<(String, String)>,
    JsonOrDefault(body): JsonOrDefault<ExportRequest>,
) -> ApiResult<ExportResult> {
    let (session, cid) = ids(&id, &cid)?;
    let options = export_options(&body, state.settings.data_dir.join("exports"))?;
    let result = state.checkpoints.export(session, cid, &options).await?;
    state.bus.publish(
        &topics::checkpoints(session),
        "checkpoint.exported",
        json!({
            "session": session,
            "checkpoint": cid,
            "format": result.format,
            "size_bytes": result.size_bytes,
            "by": ctx.identity.user_id,
        }),
    );
    ok(result)
}

pub async fn import(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(body): ApiJson<ImportRequest>,
) -> ApiResult<Value> {
    let archive = STANDARD
        .decode(body.data.trim())
        .map_err(|err| ApiError::invalid_field("data", format!("data must be base64: {err}")))?;
    if archive.is_empty() {
        return Err(ApiError::invalid_field("data", "archive is empty"));
    }
    let format = parse_format(body.format.as_deref())?;
    let target_session = body
        .target_session
        .as_deref()
        .map(|target| validate_name("target_session", target).map(str::to_string))
        .transpose()?;

    let dir = scratch_dir(&state, "imports");
    let path = dir.join(format!("import.{}", format.as_str()));
    let written = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&path, &archive).await
    }
    .await;
    if let Err(err) = written {
        discard(&dir).await;
        return Err(ApiError::internal(format!("staging archive: {err}")));
    }
    let imported = state
        .checkpoints
        .import(
            &path,
            &ImportOptions {
                target_session: target_session.clone(),
                verify_checksums: body.verify_checksums,
                allow_overwrite: body.allow_overwrite,
            },
        )
        .await;
    discard(&dir).await;
    let imported = imported?;

    let session = target_session
        .or_else(|| imported.get("session").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    if !session.is_empty() {
        state.bus.publish(
            &topics::checkpoints(&session),
            "checkpoint.imported",
            json!({ "session": session, "result": imported, "by": ctx.identity.user_id }),
        );
    }
    ok(imported)
}

pub async fn verify(
    State(state): State<AppState>,
    ApiPath((id, cid)): ApiPath<(String, String)>,
) -> ApiResult<VerifyReport> {
    let (session, cid) = ids(&id, &cid)?;
    ok(state.checkpoints.verify(session, cid).await?)
}

/// Rolls the working tree back. Dry runs change nothing and skip the gate.
pub async fn rollback(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    ApiPath((id, cid)): ApiPath<(String, String)>,
    JsonOrDefault(body): JsonOrDefault<RollbackRequest>,
) -> ApiResult<Value> {
    let (session, cid) = ids(&id, &cid)?;
    let approval = if body.dry_run {
        None
    } else {
        approval_gate(&state, &ctx, &headers, "checkpoint.rollback", &format!("{session}/{cid}"))?
    };
    let options = RestoreOptions {
        dry_run: body.dry_run,
        force: body.force,
        target_session: None,
        skip_git: body.no_git,
    };
    let result = state.checkpoints.restore(session, cid, &options).await?;
    if !body.dry_run {
        state.bus.publish(
            &topics::checkpoints(session),
            "checkpoint.rolled_back",
            json!({ "session": session, "checkpoint": cid, "approval_id": approval, "by": ctx.identity.user_id }),
        );
    }
    ok(result)
}

pub async fn restore(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    ApiPath((id, cid)): ApiPath<(String, String)>,
    JsonOrDefault(body): JsonOrDefault<RestoreRequest>,
) -> ApiResult<Value> {
    let (session, cid) = ids(&id, &cid)?;
    let target_session = body
        .target_session
        .as_deref()
        .map(|target| validate_name("target_session", target).map(str::to_string))
        .transpose()?;
    let approval = if body.dry_run {
        None
    } else {
        approval_gate(&state, &ctx, &headers, "checkpoint.restore", &format!("{session}/{cid}"))?
    };
    let options = RestoreOptions {
        dry_run: body.dry_run,
        force: body.force,
        target_session: target_session.clone(),
        skip_git: body.skip_git,
    };
    let result = state.checkpoints.restore(session, cid, &options).await?;
    if !body.dry_run {
        state.bus.publish(
            &topics::checkpoints(session),
            "checkpoint.restored",
            json!({
                "session": session,
                "checkpoint": cid,
                "target_session": target_session,
                "approval_id": approval,
                "by": ctx.identity.user_id,
            }),
        );
    }
    ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_default_to_tar_gz() {
        assert_eq!(parse_format(None).unwrap(), ExportFormat::TarGz);
        assert_eq!(parse_format(Some("")).unwrap(), ExportFormat::TarGz);
        assert_eq!(parse_format(Some("zip")).unwrap(), ExportFormat::Zip);
        let err = parse_format(Some("rar")).unwrap_err();
        assert_eq!(err.details.unwrap()["field"], "format");
    }

    #[test]
    fn export_defaults_redact_and_include_everything() {
        let request: ExportRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.redact_secrets);
        assert!(request.include_scrollback);
        assert!(request.include_git_patch);
        assert!(!request.rewrite_paths);
    }
}
