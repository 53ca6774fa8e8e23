//! In-memory [`DomControl`] for tests: scripted tabs, pages and failure modes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use domshell_core::{AxNode, DomControl, Error, FrameInfo, PageInfo, Result, TabInfo};

#[derive(Debug, Clone, Default)]
pub struct MockPage {
    pub title: String,
    pub url: String,
    pub nodes: Vec<AxNode>,
    pub texts: HashMap<i64, String>,
    pub cookies: Vec<(String, String)>,
    pub frames: Vec<FrameInfo>,
}

impl MockPage {
    pub fn new(title: impl Into<String>, url: impl Into<String>, nodes: Vec<AxNode>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            nodes,
            ..Default::default()
        }
    }

    pub fn with_text(mut self, backend_id: i64, text: impl Into<String>) -> Self {
        self.texts.insert(backend_id, text.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    fn has_backend(&self, backend_id: i64) -> bool {
        self.nodes.iter().any(|n| n.backend_id == Some(backend_id))
    }
}

#[derive(Default)]
struct MockState {
    tabs: Vec<TabInfo>,
    pages: HashMap<i64, MockPage>,
    /// Pages served by `navigate`/`open_tab`, keyed by URL.
    routes: HashMap<String, MockPage>,
    attached: Option<i64>,
    calls: Vec<String>,
    direct_click_fails: bool,
    disconnected: bool,
    /// Time `attach` takes before it takes effect.
    attach_delay: Option<Duration>,
}

/// Scripted browser. Every trait call is recorded in [`MockControl::calls`].
#[derive(Default)]
pub struct MockControl {
    state: Mutex<MockState>,
    generation: AtomicU64,
}

impl MockControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tab(self, id: i64, window_id: i64, page: MockPage) -> Self {
        {
            let mut state = self.lock();
            let first = state.tabs.is_empty();
            state.tabs.push(TabInfo {
                id,
                window_id,
                title: page.title.clone(),
                url: page.url.clone(),
                active: first,
            });
            state.pages.insert(id, page);
        }
        self
    }

    /// Serve `page` whenever `url` is navigated to or opened.
    pub fn with_route(self, url: impl Into<String>, page: MockPage) -> Self {
        self.lock().routes.insert(url.into(), page);
        self
    }

    /// Replace a tab's accessibility nodes, as a page update would.
    pub fn set_nodes(&self, tab_id: i64, nodes: Vec<AxNode>) {
        if let Some(page) = self.lock().pages.get_mut(&tab_id) {
            page.nodes = nodes;
        }
        self.bump_generation();
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_direct_click(&self, fails: bool) {
        self.lock().direct_click_fails = fails;
    }

    /// Make every `attach` wait `delay` first, like a slow browser.
    pub fn set_attach_delay(&self, delay: Duration) {
        self.lock().attach_delay = Some(delay);
    }

    /// Simulate losing the control-plane connection.
    pub fn set_disconnected(&self, disconnected: bool) {
        let mut state = self.lock();
        state.disconnected = disconnected;
        if disconnected {
            state.attached = None;
        }
    }

    /// Move the shared attachment without going through a kernel.
    pub fn attach_elsewhere(&self, tab_id: i64) {
        self.lock().attached = Some(tab_id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call and return the state, failing while disconnected.
    fn enter(&self, call: String) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.disconnected {
            return Err(Error::NotAttached);
        }
        Ok(state)
    }

    fn with_page<T>(
        &self,
        call: String,
        backend_id: Option<i64>,
        f: impl FnOnce(&mut MockState, i64) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.enter(call)?;
        let tab = state.attached.ok_or(Error::NotAttached)?;
        if let Some(backend_id) = backend_id {
            let known = state.pages.get(&tab).map(|p| p.has_backend(backend_id));
            if known != Some(true) {
                return Err(Error::Control(format!("no node with backend id {}", backend_id)));
            }
        }
        f(&mut *state, tab)
    }
}

fn page_of(state: &MockState, tab: i64) -> Result<&MockPage> {
    state
        .pages
        .get(&tab)
        .ok_or_else(|| Error::Control(format!("tab {} has no page", tab)))
}

fn load(state: &mut MockState, tab: i64, url: &str) {
    let page = state
        .routes
        .get(url)
        .cloned()
        .unwrap_or_else(|| MockPage::new(url, url, vec![AxNode::new("1", "RootWebArea")]));
    if let Some(info) = state.tabs.iter_mut().find(|t| t.id == tab) {
        info.title = page.title.clone();
        info.url = page.url.clone();
    }
    state.pages.insert(tab, page);
}

#[async_trait]
impl DomControl for MockControl {
    async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
        Ok(self.enter("list_tabs".into())?.tabs.clone())
    }

    async fn attached_tab(&self) -> Option<i64> {
        self.lock().attached
    }

    async fn attach(&self, tab_id: i64) -> Result<()> {
        let delay = self.lock().attach_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.enter(format!("attach {}", tab_id))?;
        if !state.pages.contains_key(&tab_id) {
            return Err(Error::NoSuchEntry(tab_id.to_string()));
        }
        state.attached = Some(tab_id);
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        self.enter("detach".into())?.attached = None;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<AxNode>> {
        self.with_page("snapshot".into(), None, |state, tab| {
            Ok(page_of(state, tab)?.nodes.clone())
        })
    }

    async fn click(&self, backend_id: i64) -> Result<()> {
        self.with_page(format!("click {}", backend_id), Some(backend_id), |state, _| {
            if state.direct_click_fails {
                return Err(Error::Control("element is not clickable".into()));
            }
            Ok(())
        })?;
        self.bump_generation();
        Ok(())
    }

    async fn click_at(&self, backend_id: i64) -> Result<()> {
        self.with_page(format!("click_at {}", backend_id), Some(backend_id), |_, _| Ok(()))?;
        self.bump_generation();
        Ok(())
    }

    async fn focus(&self, backend_id: i64) -> Result<()> {
        self.with_page(format!("focus {}", backend_id), Some(backend_id), |_, _| Ok(()))
    }

    async fn type_text(&self, backend_id: i64, text: &str) -> Result<()> {
        self.with_page(format!("type {} {}", backend_id, text), Some(backend_id), |_, _| Ok(()))
    }

    async fn element_text(&self, backend_id: i64) -> Result<String> {
        self.with_page(format!("text {}", backend_id), Some(backend_id), |state, tab| {
            Ok(page_of(state, tab)?
                .texts
                .get(&backend_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    async fn page_info(&self) -> Result<PageInfo> {
        self.with_page("page_info".into(), None, |state, tab| {
            let page = page_of(state, tab)?;
            Ok(PageInfo {
                url: page.url.clone(),
                title: page.title.clone(),
            })
        })
    }

    async fn frames(&self) -> Result<Vec<FrameInfo>> {
        self.with_page("frames".into(), None, |state, tab| {
            let page = page_of(state, tab)?;
            let mut frames = vec![FrameInfo {
                id: "main".into(),
                parent_id: None,
                url: page.url.clone(),
            }];
            frames.extend(page.frames.iter().cloned());
            Ok(frames)
        })
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.with_page(format!("navigate {}", url), None, |state, tab| {
            load(state, tab, url);
            Ok(())
        })?;
        self.bump_generation();
        Ok(())
    }

    async fn open_tab(&self, url: &str) -> Result<TabInfo> {
        let mut state = self.enter(format!("open {}", url))?;
        let id = state.tabs.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let window_id = state.tabs.first().map(|t| t.window_id).unwrap_or(1);
        state.tabs.push(TabInfo {
            id,
            window_id,
            title: String::new(),
            url: String::new(),
            active: true,
        });
        load(&mut *state, id, url);
        let info = state
            .tabs
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| Error::Control("tab vanished".into()))?;
        Ok(info)
    }

    async fn cookies(&self) -> Result<Vec<(String, String)>> {
        self.with_page("cookies".into(), None, |state, tab| {
            Ok(page_of(state, tab)?.cookies.clone())
        })
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
