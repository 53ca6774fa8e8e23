//! DevTools HTTP endpoint discovery.

use std::time::Duration;

use domshell_core::config::BrowserConfig;
use domshell_core::{Error, Result};
use serde_json::Value;
use tracing::debug;

/// Ask `/json/version` for the browser-level WebSocket URL.
pub async fn browser_ws_url(config: &BrowserConfig) -> Result<String> {
    let url = format!("{}/json/version", config.http_base());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| Error::Control(format!("http client: {}", e)))?;

    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Control(format!("DevTools endpoint {} unreachable: {}", url, e)))?;
    let body: Value = resp
        .json()
        .await
        .map_err(|e| Error::Control(format!("bad /json/version response: {}", e)))?;

    let ws_url = ws_url_from_version(&body)
        .ok_or_else(|| Error::Control("no webSocketDebuggerUrl in /json/version".into()))?;
    debug!(ws_url = %ws_url, "discovered browser endpoint");
    Ok(ws_url)
}

fn ws_url_from_version(body: &Value) -> Option<String> {
    body.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ws_url_from_version() {
        let body = json!({
            "Browser": "Chrome/120.0.6099.71",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
        });
        assert_eq!(
            ws_url_from_version(&body).as_deref(),
            Some("ws://127.0.0.1:9222/devtools/browser/abc")
        );
        assert_eq!(ws_url_from_version(&json!({"webSocketDebuggerUrl": ""})), None);
    }
}
