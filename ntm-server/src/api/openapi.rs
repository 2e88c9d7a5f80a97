use crate::app::registry::{CommandSpec, API_PREFIX, COMMANDS};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const OPENAPI_VERSION: &str = "3.1.0";

/// Renders the OpenAPI 3.1 document for `commands`.
pub fn render(commands: &[CommandSpec]) -> Value {
    let mut paths: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    let mut tags = BTreeSet::new();
    let mut schemas: BTreeSet<&'static str> = BTreeSet::new();

    for spec in commands {
        tags.insert(spec.category);
        schemas.insert(spec.output);
        if let Some(input) = spec.input {
            schemas.insert(input);
        }
        paths
            .entry(spec.full_path())
            .or_default()
            .insert(spec.method.openapi_key().to_string(), operation(spec));
    }

    let mut components = Map::new();
    components.insert("SuccessResponse".into(), success_schema());
    components.insert("ErrorResponse".into(), error_schema());
    for name in schemas {
        if !components.contains_key(name) {
            components.insert(name.to_string(), named_schema(name));
        }
    }

    json!({
        "openapi": OPENAPI_VERSION,
        "info": {
            "title": "ntm control plane",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "REST, WebSocket and SSE interface for ntm sessions, agents and safety controls.",
        },
        "servers": [{"url": "/"}],
        "tags": tags.iter().map(|tag| json!({"name": tag})).collect::<Vec<_>>(),
        "paths": paths,
        "components": {
            "schemas": components,
            "securitySchemes": {
                "bearerAuth": {"type": "http", "scheme": "bearer", "bearerFormat": "JWT"},
                "apiKey": {"type": "apiKey", "in": "header", "name": "X-API-Key"},
            },
        },
        "security": [{"bearerAuth": []}, {"apiKey": []}],
    })
}

pub fn render_registry() -> Value {
    render(COMMANDS)
}

fn operation(spec: &CommandSpec) -> Value {
    let parameters: Vec<Value> = spec
        .path_params()
        .into_iter()
        .map(|name| {
            json!({
                "name": name,
                "in": "path",
                "required": true,
                "schema": {"type": "string"},
            })
        })
        .collect();

    let mut op = json!({
        "operationId": spec.operation_id(),
        "summary": spec.description,
        "tags": [spec.category],
        "responses": {
            "200": response("Success", spec.output),
            "400": response("Invalid input", "ErrorResponse"),
            "401": response("Authentication required", "ErrorResponse"),
            "500": response("Internal error", "ErrorResponse"),
        },
        "x-ntm-command": spec.name,
        "x-ntm-safety": spec.safety,
        "x-ntm-idempotent": spec.idempotent,
        "x-ntm-access": spec.access.describe(),
    });
    if !parameters.is_empty() {
        op["parameters"] = Value::Array(parameters);
    }
    if !spec.emits.is_empty() {
        op["x-ntm-events"] = json!(spec.emits);
    }
    if let Some(input) = spec.input {
        let mut media = json!({"schema": schema_ref(input)});
        if let Some(example) = spec.example.and_then(|raw| serde_json::from_str::<Value>(raw).ok()) {
            media["example"] = example;
        }
        op["requestBody"] = json!({
            "required": true,
            "content": {"application/json": media},
        });
    }
    op
}

fn response(description: &str, schema: &str) -> Value {
    json!({
        "description": description,
        "content": {"application/json": {"schema": schema_ref(schema)}},
    })
}

fn schema_ref(name: &str) -> Value {
    json!({"$ref": format!("#/components/schemas/{name}")})
}

fn success_schema() -> Value {
    json!({
        "type": "object",
        "required": ["success", "request_id", "timestamp"],
        "properties": {
            "success": {"type": "boolean", "const": true},
            "request_id": {"type": "string"},
            "timestamp": {"type": "string", "format": "date-time"},
        },
        "additionalProperties": true,
    })
}

fn error_schema() -> Value {
    json!({
        "type": "object",
        "required": ["success", "error", "error_code", "request_id", "timestamp"],
        "properties": {
            "success": {"type": "boolean", "const": false},
            "error": {"type": "string"},
            "error_code": {
                "type": "string",
                "enum": super::envelope::ErrorCode::ALL.iter().map(|code| code.as_str()).collect::<Vec<_>>(),
            },
            "details": {"type": "object"},
            "approval": {"type": "object"},
            "request_id": {"type": "string"},
            "timestamp": {"type": "string", "format": "date-time"},
        },
    })
}

fn named_schema(name: &str) -> Value {
    match name {
        "Approval" => json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "action": {"type": "string"},
                "resource": {"type": "string"},
                "requestor": {"type": "string"},
                "status": {"type": "string", "enum": ["pending", "approved", "denied", "expired"]},
                "slb_required": {"type": "boolean"},
                "expires_at": {"type": "string", "format": "date-time"},
            },
        }),
        "ApprovalRequest" => json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {"type": "string"},
                "resource": {"type": "string"},
                "reason": {"type": "string"},
            },
        }),
        "PolicyContent" => json!({
            "type": "object",
            "required": ["content"],
            "properties": {"content": {"type": "string"}},
        }),
        "ValidationReport" => json!({
            "type": "object",
            "properties": {
                "valid": {"type": "boolean"},
                "errors": {"type": "array", "items": {"type": "string"}},
                "warnings": {"type": "array", "items": {"type": "string"}},
            },
        }),
        "Job" => json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "type": {"type": "string"},
                "status": {"type": "string", "enum": ["pending", "running", "completed", "failed", "cancelled"]},
            },
        }),
        "EventList" => json!({
            "type": "object",
            "properties": {
                "events": {"type": "array", "items": {"type": "object"}},
                "reset": {"type": "boolean"},
            },
        }),
        "Archive" => json!({"type": "string", "contentMediaType": "application/gzip"}),
        _ => json!({"type": "object", "additionalProperties": true}),
    }
}

/// The viewer page; `scheme` follows how the request reached us.
pub fn docs_html(scheme: &str, host: &str) -> String {
    let spec_url = format!("{scheme}://{host}{}/openapi.json", API_PREFIX);
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>ntm API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {{
      window.ui = SwaggerUIBundle({{ url: "{spec_url}", dom_id: "#swagger-ui" }});
    }};
  </script>
</body>
</html>
"##
    )
}
