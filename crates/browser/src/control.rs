//! [`DomControl`] over a single shared CDP connection.
//!
//! A supervisor task owns the connection lifecycle: it connects, watches for
//! loss, and reconnects with exponential backoff. While no connection is up
//! every call fails with `Error::NotAttached`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domshell_core::config::BrowserConfig;
use domshell_core::{AxNode, DomControl, Error, FrameInfo, PageInfo, Result, TabInfo};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ax::{
    extract_center_from_box_model, flatten_frame_tree, key_event_params, merge_frame,
    parse_ax_nodes,
};
use crate::cdp::{CdpClient, CdpEvent};
use crate::discovery::browser_ws_url;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Events that invalidate the attached page's snapshot.
const PAGE_CHANGE_EVENTS: &[&str] = &[
    "Page.frameNavigated",
    "Page.loadEventFired",
    "DOM.documentUpdated",
    "Target.detachedFromTarget",
];

const CLICK_FN: &str = "function() { this.scrollIntoView({block: 'center'}); this.click(); }";

const TEXT_FN: &str = "function() { \
    const el = this.nodeType === 9 ? this.body : this; \
    return el ? (el.innerText || el.textContent || '') : ''; }";

#[derive(Debug, Clone)]
struct Attachment {
    tab_id: i64,
    target_id: String,
    session_id: String,
}

#[derive(Default)]
struct TabRegistry {
    /// CDP targetId -> tab id, first-seen order.
    ids: HashMap<String, i64>,
    next_id: i64,
}

impl TabRegistry {
    fn id_for(&mut self, target_id: &str) -> i64 {
        if let Some(id) = self.ids.get(target_id) {
            return *id;
        }
        self.next_id += 1;
        self.ids.insert(target_id.to_string(), self.next_id);
        self.next_id
    }

    fn target_for(&self, tab_id: i64) -> Option<String> {
        self.ids
            .iter()
            .find(|(_, id)| **id == tab_id)
            .map(|(target, _)| target.clone())
    }
}

pub struct CdpControl {
    config: BrowserConfig,
    client: RwLock<Option<Arc<CdpClient>>>,
    attached: Mutex<Option<Attachment>>,
    tabs: Mutex<TabRegistry>,
    generation: Arc<AtomicU64>,
}

impl CdpControl {
    pub fn new(config: BrowserConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            client: RwLock::new(None),
            attached: Mutex::new(None),
            tabs: Mutex::new(TabRegistry::default()),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start the connect / watch / reconnect loop.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.supervise().await })
    }

    /// Connect once without supervision; used by one-shot CLI runs.
    pub async fn connect(&self) -> Result<()> {
        self.connect_once().await.map(|_| ())
    }

    pub async fn is_connected(&self) -> bool {
        self.client
            .read()
            .await
            .as_ref()
            .map(|c| !c.is_closed())
            .unwrap_or(false)
    }

    async fn supervise(self: Arc<Self>) {
        let max_backoff = Duration::from_secs(self.config.reconnect_max_backoff_secs.max(1));
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.connect_once().await {
                Ok(client) => {
                    backoff = INITIAL_BACKOFF;
                    client.closed().await;
                    warn!("browser connection lost");
                    *self.client.write().await = None;
                    *self.attached.lock().await = None;
                    self.bump();
                }
                Err(e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "browser connect failed");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, max_backoff);
        }
    }

    async fn connect_once(&self) -> Result<Arc<CdpClient>> {
        let ws_url = browser_ws_url(&self.config).await?;
        let client = Arc::new(CdpClient::connect(&ws_url).await?);
        let events = client.subscribe_events(PAGE_CHANGE_EVENTS).await;
        tokio::spawn(pump_page_events(
            client.clone(),
            events,
            self.generation.clone(),
        ));
        *self.client.write().await = Some(client.clone());
        info!(ws_url = %ws_url, "connected to browser");
        Ok(client)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn client(&self) -> Result<Arc<CdpClient>> {
        self.client
            .read()
            .await
            .clone()
            .filter(|c| !c.is_closed())
            .ok_or(Error::NotAttached)
    }

    /// Client plus the attached session.
    async fn session(&self) -> Result<(Arc<CdpClient>, Attachment)> {
        let client = self.client().await?;
        let attached = self.attached.lock().await.clone().ok_or(Error::NotAttached)?;
        Ok((client, attached))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let (client, att) = self.session().await?;
        client.send_session(&att.session_id, method, params).await
    }

    async fn window_of(&self, client: &CdpClient, target_id: &str) -> i64 {
        match client
            .send_command("Browser.getWindowForTarget", json!({ "targetId": target_id }))
            .await
        {
            Ok(result) => result.get("windowId").and_then(|v| v.as_i64()).unwrap_or(0),
            Err(e) => {
                debug!(target_id, error = %e, "no window for target");
                0
            }
        }
    }

    async fn tab_info(&self, client: &CdpClient, info: &Value) -> Option<TabInfo> {
        let target_id = info.get("targetId")?.as_str()?;
        let id = self.tabs.lock().await.id_for(target_id);
        let attached = self.attached.lock().await.as_ref().map(|a| a.tab_id);
        Some(TabInfo {
            id,
            window_id: self.window_of(client, target_id).await,
            title: str_field(info, "title"),
            url: str_field(info, "url"),
            active: attached == Some(id),
        })
    }

    async fn object_id(&self, backend_id: i64) -> Result<String> {
        let result = self
            .call("DOM.resolveNode", json!({ "backendNodeId": backend_id }))
            .await?;
        result
            .get("object")
            .and_then(|o| o.get("objectId"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Control(format!("cannot resolve element {}", backend_id)))
    }

    async fn call_on(&self, backend_id: i64, function: &str) -> Result<Value> {
        let object_id = self.object_id(backend_id).await?;
        let result = self
            .call(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function,
                    "returnByValue": true,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .unwrap_or("script exception");
            return Err(Error::Control(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Child-frame trees, each spliced under its owner iframe node.
    async fn merge_child_frames(&self, nodes: &mut Vec<AxNode>) -> Result<()> {
        let tree = self.call("Page.getFrameTree", json!({})).await?;
        let frames = flatten_frame_tree(&tree);
        for (n, frame) in frames.iter().skip(1).enumerate() {
            let prefix = format!("f{}:", n + 1);
            let owner = match self
                .call("DOM.getFrameOwner", json!({ "frameId": frame.id }))
                .await
            {
                Ok(owner) => owner.get("backendNodeId").and_then(|v| v.as_i64()),
                Err(e) => {
                    debug!(frame = %frame.id, error = %e, "frame owner unavailable");
                    None
                }
            };
            let Some(owner) = owner else { continue };
            // Out-of-process frames answer on their own target; those are skipped.
            let frame_tree = match self
                .call("Accessibility.getFullAXTree", json!({ "frameId": frame.id }))
                .await
            {
                Ok(tree) => tree,
                Err(e) => {
                    debug!(frame = %frame.id, error = %e, "frame tree unavailable");
                    continue;
                }
            };
            if !merge_frame(nodes, owner, parse_ax_nodes(&frame_tree, &prefix)) {
                debug!(frame = %frame.id, "frame owner not in tree");
            }
        }
        Ok(())
    }
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Bump the page generation on every page-change event until the
/// connection goes away.
async fn pump_page_events(
    client: Arc<CdpClient>,
    mut events: tokio::sync::mpsc::Receiver<CdpEvent>,
    generation: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    debug!(method = %event.method, session = ?event.session_id, "page changed");
                    generation.fetch_add(1, Ordering::SeqCst);
                }
                None => break,
            },
            _ = client.closed() => break,
        }
    }
}

#[async_trait]
impl DomControl for CdpControl {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        let client = self.client().await?;
        let result = client.send_command("Target.getTargets", json!({})).await?;
        let infos = result
            .get("targetInfos")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut tabs = Vec::new();
        for info in infos
            .iter()
            .filter(|i| i.get("type").and_then(|t| t.as_str()) == Some("page"))
        {
            if let Some(tab) = self.tab_info(&client, info).await {
                tabs.push(tab);
            }
        }
        // window-then-tab, keeping first-seen window order
        let mut windows: Vec<i64> = Vec::new();
        for tab in &tabs {
            if !windows.contains(&tab.window_id) {
                windows.push(tab.window_id);
            }
        }
        tabs.sort_by_key(|t| windows.iter().position(|w| *w == t.window_id));
        Ok(tabs)
    }

    async fn attached_tab(&self) -> Option<i64> {
        if !self.is_connected().await {
            return None;
        }
        self.attached.lock().await.as_ref().map(|a| a.tab_id)
    }

    async fn attach(&self, tab_id: i64) -> Result<()> {
        let client = self.client().await?;
        let known = self.tabs.lock().await.target_for(tab_id);
        let target_id = match known {
            Some(target) => target,
            None => {
                self.list_tabs().await?;
                self.tabs
                    .lock()
                    .await
                    .target_for(tab_id)
                    .ok_or_else(|| Error::NoSuchEntry(tab_id.to_string()))?
            }
        };

        self.detach().await?;

        let result = client
            .send_command(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Control("attachToTarget returned no sessionId".into()))?;

        for domain in ["Page", "DOM", "Runtime", "Network", "Accessibility"] {
            client.enable_domain(&session_id, domain).await?;
        }
        if let Err(e) = client
            .send_command("Target.activateTarget", json!({ "targetId": target_id }))
            .await
        {
            debug!(tab_id, error = %e, "activateTarget failed");
        }

        info!(tab_id, target_id = %target_id, "attached to tab");
        *self.attached.lock().await = Some(Attachment {
            tab_id,
            target_id,
            session_id,
        });
        self.bump();
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        let previous = self.attached.lock().await.take();
        let Some(previous) = previous else {
            return Ok(());
        };
        let client = self.client().await?;
        if let Err(e) = client
            .send_command(
                "Target.detachFromTarget",
                json!({ "sessionId": previous.session_id }),
            )
            .await
        {
            debug!(tab_id = previous.tab_id, error = %e, "detachFromTarget failed");
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<AxNode>> {
        let tree = self.call("Accessibility.getFullAXTree", json!({})).await?;
        let mut nodes = parse_ax_nodes(&tree, "");
        self.merge_child_frames(&mut nodes).await?;
        Ok(nodes)
    }

    async fn click(&self, backend_id: i64) -> Result<()> {
        self.call_on(backend_id, CLICK_FN).await?;
        Ok(())
    }

    async fn click_at(&self, backend_id: i64) -> Result<()> {
        if let Err(e) = self
            .call("DOM.scrollIntoViewIfNeeded", json!({ "backendNodeId": backend_id }))
            .await
        {
            debug!(backend_id, error = %e, "scrollIntoViewIfNeeded failed");
        }
        let bm = self
            .call("DOM.getBoxModel", json!({ "backendNodeId": backend_id }))
            .await?;
        let (x, y) = extract_center_from_box_model(&bm)
            .ok_or_else(|| Error::Control(format!("element {} has no box", backend_id)))?;

        for kind in ["mouseMoved", "mousePressed", "mouseReleased"] {
            self.call(
                "Input.dispatchMouseEvent",
                json!({
                    "type": kind,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn focus(&self, backend_id: i64) -> Result<()> {
        self.call("DOM.focus", json!({ "backendNodeId": backend_id }))
            .await?;
        Ok(())
    }

    async fn type_text(&self, _backend_id: i64, text: &str) -> Result<()> {
        for ch in text.chars() {
            self.call("Input.dispatchKeyEvent", key_event_params("keyDown", ch))
                .await?;
            self.call("Input.dispatchKeyEvent", key_event_params("keyUp", ch))
                .await?;
        }
        Ok(())
    }

    async fn element_text(&self, backend_id: i64) -> Result<String> {
        let value = self.call_on(backend_id, TEXT_FN).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn page_info(&self) -> Result<PageInfo> {
        let (client, att) = self.session().await?;
        let result = client
            .send_command("Target.getTargetInfo", json!({ "targetId": att.target_id }))
            .await?;
        let info = result.get("targetInfo").cloned().unwrap_or(Value::Null);
        Ok(PageInfo {
            url: str_field(&info, "url"),
            title: str_field(&info, "title"),
        })
    }

    async fn frames(&self) -> Result<Vec<FrameInfo>> {
        let tree = self.call("Page.getFrameTree", json!({})).await?;
        Ok(flatten_frame_tree(&tree))
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let (client, att) = self.session().await?;
        let mut loads = client.subscribe_events(&["Page.loadEventFired"]).await;

        let result = client
            .send_session(&att.session_id, "Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(error) = result
            .get("errorText")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            return Err(Error::Control(format!("navigation to {} failed: {}", url, error)));
        }

        let wait = Duration::from_secs(self.config.navigate_timeout_secs);
        let session_id = att.session_id.clone();
        let loaded = tokio::time::timeout(wait, async move {
            while let Some(event) = loads.recv().await {
                if event.session_id.as_deref() == Some(session_id.as_str()) {
                    return true;
                }
            }
            false
        })
        .await;
        match loaded {
            Ok(true) => debug!(url, "page loaded"),
            Ok(false) => return Err(Error::NotAttached),
            Err(_) => warn!(url, timeout_secs = wait.as_secs(), "load not reported in time, continuing"),
        }
        self.bump();
        Ok(())
    }

    async fn open_tab(&self, url: &str) -> Result<TabInfo> {
        let client = self.client().await?;
        let result = client
            .send_command("Target.createTarget", json!({ "url": url }))
            .await?;
        let target_id = result
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Control("createTarget returned no targetId".into()))?;
        let info = client
            .send_command("Target.getTargetInfo", json!({ "targetId": target_id }))
            .await?;
        let info = info.get("targetInfo").cloned().unwrap_or(Value::Null);
        let mut tab = self
            .tab_info(&client, &info)
            .await
            .ok_or_else(|| Error::Control("new tab has no target info".into()))?;
        if tab.url.is_empty() {
            tab.url = url.to_string();
        }
        info!(tab_id = tab.id, url, "opened tab");
        Ok(tab)
    }

    async fn cookies(&self) -> Result<Vec<(String, String)>> {
        let result = self.call("Network.getCookies", json!({})).await?;
        Ok(result
            .get("cookies")
            .and_then(|v| v.as_array())
            .map(|cookies| {
                cookies
                    .iter()
                    .map(|c| (str_field(c, "name"), str_field(c, "value")))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
