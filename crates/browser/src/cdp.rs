//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! One browser-level connection carries every flat target session: commands
//! addressed to an attached page carry its `sessionId`, and events are handed
//! to subscribers together with the session they came from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use domshell_core::{Error, Result};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, warn};

/// Bound on a single CDP round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// An event frame, with the flat session it belongs to (none for browser-level events).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub session_id: Option<String>,
    pub params: Value,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type Listeners = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<CdpEvent>>>>>;

pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: Pending,
    next_id: AtomicU64,
    /// Event listeners (domain.event -> channels).
    event_listeners: Listeners,
    /// Flips to `true` once the socket is gone.
    closed_rx: watch::Receiver<bool>,
    _reader_handle: tokio::task::JoinHandle<()>,
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a browser-level CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Control(format!("failed to connect to {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);
        let (closed_tx, closed_rx) = watch::channel(false);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();
        let event_listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let val = match serde_json::from_str::<Value>(&text) {
                            Ok(val) => val,
                            Err(e) => {
                                warn!(error = %e, "dropping malformed CDP frame");
                                continue;
                            }
                        };
                        route_frame(val, &pending_clone, &events_clone).await;
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Fail every in-flight command by dropping its completion handle.
            pending_clone.lock().await.clear();
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            closed_rx,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Browser-level command.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        self.send(None, method, params).await
    }

    /// Command routed to an attached target session.
    pub async fn send_session(&self, session_id: &str, method: &str, params: Value) -> Result<Value> {
        self.send(Some(session_id), method, params).await
    }

    async fn send(&self, session_id: Option<&str>, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::NotAttached);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            msg["sessionId"] = json!(session_id);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::NotAttached);
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(error) => {
                    let message = error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string());
                    Err(Error::Control(format!("{}: {}", method, message)))
                }
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(Error::NotAttached),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::CommandTimeout(format!(
                    "CDP command '{}' after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// One receiver for several event methods.
    pub async fn subscribe_events(&self, methods: &[&str]) -> mpsc::Receiver<CdpEvent> {
        let (tx, rx) = mpsc::channel(64);
        let mut listeners = self.event_listeners.lock().await;
        for method in methods {
            listeners
                .entry(method.to_string())
                .or_insert_with(Vec::new)
                .push(tx.clone());
        }
        rx
    }

    /// Enable a CDP domain on a target session.
    pub async fn enable_domain(&self, session_id: &str, domain: &str) -> Result<()> {
        self.send_session(session_id, &format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }
}

async fn route_frame(val: Value, pending: &Pending, listeners: &Listeners) {
    if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
        if let Some(tx) = pending.lock().await.remove(&id) {
            let _ = tx.send(val);
        }
        return;
    }
    let Some(method) = val.get("method").and_then(|v| v.as_str()) else {
        warn!("dropping CDP frame with neither id nor method");
        return;
    };

    let mut listeners = listeners.lock().await;
    if let Some(senders) = listeners.get_mut(method) {
        let event = CdpEvent {
            method: method.to_string(),
            session_id: val
                .get("sessionId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            params: val.get("params").cloned().unwrap_or(Value::Null),
        };
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            let _ = tx.try_send(event.clone());
        }
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_frame_completes_pending() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(4, tx);

        route_frame(json!({"id": 4, "result": {"ok": true}}), &pending, &listeners).await;
        let response = rx.await.unwrap();
        assert_eq!(response["result"]["ok"], json!(true));
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_route_frame_delivers_events_with_session() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::channel(4);
        listeners
            .lock()
            .await
            .insert("Page.loadEventFired".into(), vec![tx]);

        route_frame(
            json!({"method": "Page.loadEventFired", "sessionId": "S1", "params": {"timestamp": 1.5}}),
            &pending,
            &listeners,
        )
        .await;
        // unknown events and id-less garbage are dropped quietly
        route_frame(json!({"method": "Page.other"}), &pending, &listeners).await;
        route_frame(json!({"weird": true}), &pending, &listeners).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
        assert_eq!(event.session_id.as_deref(), Some("S1"));
        assert_eq!(event.params["timestamp"], json!(1.5));
        assert!(rx.try_recv().is_err());
    }
}
