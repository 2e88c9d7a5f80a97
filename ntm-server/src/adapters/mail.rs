use crate::ports::AdapterError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// JSON-RPC client for the agent-mail MCP server (`tools/call`).
pub struct AgentMailClient {
    url: Option<String>,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl AgentMailClient {
    pub fn new(url: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.filter(|url| !url.trim().is_empty()),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AdapterError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| AdapterError::DependencyMissing("agent mail (AGENT_MAIL_URL)".into()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments},
        });

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|err| AdapterError::Unavailable(format!("agent mail unreachable: {err}")))?;
        if !response.status().is_success() {
            return Err(AdapterError::Unavailable(format!(
                "agent mail returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| AdapterError::Failed(format!("invalid agent mail response: {err}")))?;
        decode_tool_result(body)
    }
}

fn decode_tool_result(body: Value) -> Result<Value, AdapterError> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("agent mail error")
            .to_string();
        return Err(match error.get("code").and_then(Value::as_i64) {
            Some(-32602) => AdapterError::Invalid(message),
            Some(-32601) => AdapterError::NotFound(message),
            _ => AdapterError::Failed(message),
        });
    }
    let result = body
        .get("result")
        .ok_or_else(|| AdapterError::Failed("agent mail response has no result".into()))?;
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.iter().find_map(|item| item.get("text")))
        .and_then(Value::as_str);

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(AdapterError::Failed(
            text.unwrap_or("agent mail tool failed").to_string(),
        ));
    }
    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    Ok(match text {
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| json!({ "text": text })),
        None => result.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    #[tokio::test]
    async fn missing_url_is_a_dependency_error() {
        let client = AgentMailClient::new(None, Duration::from_secs(1)).unwrap();
        let err = client.call_tool("fetch_inbox", json!({})).await.unwrap_err();
        assert!(matches!(err, AdapterError::DependencyMissing(_)));
    }

    #[tokio::test]
    async fn calls_tool_over_json_rpc() {
        let app = Router::new().route(
            "/mcp",
            post(|Json(req): Json<Value>| async move {
                assert_eq!(req["method"], "tools/call");
                assert_eq!(req["params"]["name"], "fetch_inbox");
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": {"content": [{"type": "text", "text": "{\"messages\":[]}"}]}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            AgentMailClient::new(Some(format!("http://{addr}/mcp")), Duration::from_secs(5))
                .unwrap();
        let value = client
            .call_tool("fetch_inbox", json!({"agent_name": "BlueLake"}))
            .await
            .unwrap();
        assert_eq!(value, json!({"messages": []}));
    }

    #[test]
    fn tool_errors_are_decoded() {
        let err = decode_tool_result(json!({
            "result": {"isError": true, "content": [{"type": "text", "text": "reservation held"}]}
        }))
        .unwrap_err();
        assert_eq!(err, AdapterError::Failed("reservation held".into()));
        let err = decode_tool_result(json!({"error": {"code": -32602, "message": "bad args"}}))
            .unwrap_err();
        assert_eq!(err, AdapterError::Invalid("bad args".into()));
    }
}
