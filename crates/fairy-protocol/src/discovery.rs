use std::time::Duration;

use serde_json::Value;

use crate::error::ConnectError;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolve a configured endpoint to the browser's WebSocket debugger URL.
///
/// Accepts a ready `ws://`/`wss://` URL, an `http(s)://host:port` base, or a
/// bare `host:port`. HTTP endpoints are resolved through `GET /json/version`,
/// which must return a JSON object carrying `webSocketDebuggerUrl`.
pub async fn resolve_websocket_url(endpoint: &str) -> Result<String, ConnectError> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }

    let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    };
    let version_url = format!("{base}/json/version");

    let client = reqwest::Client::builder()
        .timeout(DISCOVERY_TIMEOUT)
        .build()
        .map_err(|err| ConnectError::HandshakeFailed(err.to_string()))?;

    let response = client.get(&version_url).send().await.map_err(|err| {
        if err.is_connect() || err.is_timeout() {
            ConnectError::Unreachable(format!("{version_url}: {err}"))
        } else {
            ConnectError::HandshakeFailed(err.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(ConnectError::HandshakeFailed(format!(
            "{version_url} returned {}",
            response.status()
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|err| ConnectError::HandshakeFailed(format!("invalid version payload: {err}")))?;

    parse_version_payload(&body)
}

/// Extract the debugger URL, rejecting payloads from non-browser servers.
pub(crate) fn parse_version_payload(body: &Value) -> Result<String, ConnectError> {
    if !body.is_object() {
        return Err(ConnectError::HandshakeFailed(
            "version payload is not an object".into(),
        ));
    }
    if body.get("Browser").is_none() {
        return Err(ConnectError::HandshakeFailed(
            "version payload missing Browser field".into(),
        ));
    }
    match body.get("webSocketDebuggerUrl").and_then(Value::as_str) {
        Some(url) if !url.is_empty() => Ok(url.to_string()),
        _ => Err(ConnectError::HandshakeFailed(
            "version payload missing webSocketDebuggerUrl".into(),
        )),
    }
}
