//! The navigation kernel: one caller's session over the shared browser.
//!
//! A [`Kernel`] owns a [`Session`] (browser-level prefix, DOM node chain,
//! environment) plus the cached snapshot of the attached page. Every command
//! goes through [`Kernel::run`]; errors are rendered into the reply and never
//! end the session.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use domshell_core::{safe_truncate, DomControl, Error, Result, TabInfo};
use tracing::{debug, info, warn};

use crate::command::{Command, SearchSpec, HELP};
use crate::mapper::{entry_for, map_children, root_entry, Snapshot, VfsEntry};
use crate::resolver::{self, match_tab, ordered_tabs, split_path, window_ids, BrowserPath};
use crate::search::{render_tree, search_children, search_recursive};

/// Cap on `text` and `cat` output.
const MAX_TEXT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Root,
    BrowserListing,
    AttachedRoot,
    AttachedDeep,
}

/// One resolved DOM step. The first segment of a chain is the page root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomSegment {
    pub name: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub browser: BrowserPath,
    /// Empty until a tab is entered; `[root, ...]` inside a tab.
    pub dom: Vec<DomSegment>,
    /// Tab this session last attached to. Survives `cd ~`.
    pub attached: Option<i64>,
    pub env: BTreeMap<String, String>,
}

impl Session {
    pub fn pwd(&self) -> String {
        let mut path = self.browser.to_string();
        for seg in self.dom.iter().skip(1) {
            path.push('/');
            path.push_str(&seg.name);
        }
        path
    }

    pub fn state(&self) -> KernelState {
        match (self.browser, self.dom.len()) {
            (BrowserPath::Root, _) => KernelState::Root,
            (BrowserPath::Tab { .. }, 0 | 1) => KernelState::AttachedRoot,
            (BrowserPath::Tab { .. }, _) => KernelState::AttachedDeep,
            _ => KernelState::BrowserListing,
        }
    }
}

/// Text result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub is_error: bool,
}

impl Reply {
    pub fn ok(text: String) -> Self {
        Self { text, is_error: false }
    }

    pub fn error(verb: &str, err: &Error) -> Self {
        Self {
            text: format!("{}: {}", verb, err),
            is_error: true,
        }
    }
}

pub struct Kernel {
    control: Arc<dyn DomControl>,
    session: Session,
    snapshot: Option<Arc<Snapshot>>,
    /// Tab and generation the cached snapshot was taken at.
    snapshot_tab: Option<i64>,
    snapshot_generation: u64,
    stale: bool,
    notice: Option<String>,
}

impl Kernel {
    pub fn new(control: Arc<dyn DomControl>) -> Self {
        Self {
            control,
            session: Session::default(),
            snapshot: None,
            snapshot_tab: None,
            snapshot_generation: 0,
            stale: false,
            notice: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pwd(&self) -> String {
        self.session.pwd()
    }

    /// Tab this session is inside of, if any.
    pub fn current_tab(&self) -> Option<i64> {
        self.session.browser.tab_id()
    }

    /// URL of the tab this session works in, re-attaching if needed.
    async fn current_url(&mut self) -> Result<Option<String>> {
        if self.current_tab().is_none() {
            return Ok(None);
        }
        self.ensure_attached_here().await?;
        Ok(Some(self.control.page_info().await?.url))
    }

    /// URL of the page `cmd` would read or act on, worked out without
    /// moving the session. `None` when the command touches no page.
    pub async fn page_url_for(&mut self, cmd: &Command) -> Result<Option<String>> {
        match cmd {
            Command::Pwd
            | Command::Help
            | Command::Env
            | Command::Export { .. }
            | Command::Unset { .. } => Ok(None),
            Command::Navigate { url } | Command::Open { url } => Ok(Some(normalize_url(url))),
            Command::Cd { path } => self.cd_destination_url(path.as_deref().unwrap_or("~")).await,
            Command::Ls { path: Some(p), .. } if split_absolute(p).0 => Ok(None),
            _ => self.current_url().await,
        }
    }

    /// URL of the tab `cd path` would end up in; `None` if it ends outside
    /// every tab. Tab patterns that match nothing are left for `cd` to report.
    async fn cd_destination_url(&mut self, path: &str) -> Result<Option<String>> {
        let (absolute, rest) = split_absolute(path);
        let mut browser = if absolute { BrowserPath::Root } else { self.session.browser };
        let mut depth = if absolute { 0 } else { self.session.dom.len().max(1) };
        let mut tabs: Option<Vec<TabInfo>> = None;
        let mut entered: Option<TabInfo> = None;

        for seg in split_path(rest) {
            if browser.tab_id().is_some() {
                if seg != ".." {
                    depth += 1;
                } else if depth > 1 {
                    depth -= 1;
                } else {
                    browser = browser.parent();
                    entered = None;
                }
                continue;
            }

            browser = match (browser, seg) {
                (_, "..") => browser.parent(),
                (BrowserPath::Root, "tabs") => BrowserPath::Tabs,
                (BrowserPath::Root, "windows") => BrowserPath::Windows,
                (BrowserPath::Windows, raw) => match raw.parse::<i64>() {
                    Ok(w) => BrowserPath::Window(w),
                    Err(_) => return Ok(None),
                },
                (BrowserPath::Tabs, pattern) => {
                    let all = self.tabs_cached(&mut tabs).await?;
                    let Some(tab) = match_tab(all, pattern).cloned() else {
                        return Ok(None);
                    };
                    let id = tab.id;
                    entered = Some(tab);
                    depth = 1;
                    BrowserPath::Tab { window: None, id }
                }
                (BrowserPath::Window(w), pattern) => {
                    let all = self.tabs_cached(&mut tabs).await?;
                    let in_window: Vec<TabInfo> =
                        all.iter().filter(|t| t.window_id == w).cloned().collect();
                    let Some(tab) = match_tab(&in_window, pattern).cloned() else {
                        return Ok(None);
                    };
                    let id = tab.id;
                    entered = Some(tab);
                    depth = 1;
                    BrowserPath::Tab { window: Some(w), id }
                }
                _ => return Ok(None),
            };
        }

        match (browser.tab_id(), entered) {
            (None, _) => Ok(None),
            (Some(_), Some(tab)) => Ok(Some(tab.url)),
            (Some(_), None) => self.current_url().await,
        }
    }

    /// Parse and run one command line.
    pub async fn execute(&mut self, line: &str) -> Reply {
        match Command::parse(line) {
            Ok(cmd) => self.run(cmd).await,
            Err(e) => {
                let verb = line.split_whitespace().next().unwrap_or("shell");
                Reply::error(verb, &e)
            }
        }
    }

    pub async fn run(&mut self, cmd: Command) -> Reply {
        let verb = cmd.verb();
        let mutates = cmd.mutates_page();
        let result = self.dispatch(cmd).await;
        if mutates {
            self.stale = true;
        }
        let notice = self.notice.take();
        let mut reply = match result {
            Ok(text) => Reply::ok(text),
            Err(e) => {
                debug!(verb, error = %e, "command failed");
                Reply::error(verb, &e)
            }
        };
        if let Some(notice) = notice {
            reply.text = if reply.text.is_empty() {
                notice
            } else {
                format!("{}\n{}", notice, reply.text)
            };
        }
        reply
    }

    async fn dispatch(&mut self, cmd: Command) -> Result<String> {
        debug!(verb = cmd.verb(), pwd = %self.session.pwd(), "dispatch");
        match cmd {
            Command::Pwd => Ok(self.session.pwd()),
            Command::Help => Ok(HELP.to_string()),
            Command::Env => Ok(self.env()),
            Command::Export { key, value } => {
                self.session.env.insert(key, value);
                Ok(String::new())
            }
            Command::Unset { key } => match self.session.env.remove(&key) {
                Some(_) => Ok(String::new()),
                None => Err(Error::NoSuchEntry(key)),
            },
            Command::Cd { path } => self.cd(path.as_deref().unwrap_or("~")).await,
            Command::Ls { long, path } => self.ls(long, path.as_deref()).await,
            Command::Cat { path } => self.cat(&path).await,
            Command::Text { path } => self.text(path.as_deref()).await,
            Command::Grep(spec) => self.grep(&spec).await,
            Command::Find(spec) => self.find(&spec).await,
            Command::Tree { depth, path } => self.tree(depth, path.as_deref()).await,
            Command::Refresh => self.refresh().await,
            Command::Whoami => self.whoami().await,
            Command::Navigate { url } => self.navigate(&url).await,
            Command::Open { url } => self.open(&url).await,
            Command::Click { path } => self.click(&path).await,
            Command::Focus { path } => self.focus(&path).await,
            Command::Type { path, text } => self.type_text(&path, &text).await,
            Command::Cookies => self.cookies().await,
        }
    }

    // ---- attachment and staleness ----

    /// Make sure the shared connection is attached to this session's tab.
    async fn ensure_attached_here(&mut self) -> Result<i64> {
        let tab = self.current_tab().ok_or(Error::NotAttached)?;
        if self.control.attached_tab().await != Some(tab) {
            debug!(tab, "shared attachment moved, re-attaching");
            self.control.attach(tab).await?;
            self.stale = true;
        }
        self.session.attached = Some(tab);
        Ok(tab)
    }

    /// Replace the cached snapshot wholesale.
    async fn fetch_snapshot(&mut self, tab: i64) -> Result<Arc<Snapshot>> {
        let generation = self.control.generation();
        let nodes = self.control.snapshot().await?;
        let snapshot = Arc::new(Snapshot::new(nodes));
        debug!(tab, nodes = snapshot.len(), generation, "snapshot refreshed");
        self.snapshot = Some(snapshot.clone());
        self.snapshot_tab = Some(tab);
        self.snapshot_generation = generation;
        self.stale = false;
        Ok(snapshot)
    }

    /// Fresh snapshot for the current tab. A refresh that drops the chain's
    /// leaf resets the DOM path to the page root and queues a notice; any
    /// other refresh keeps the chain as is.
    async fn ensure_fresh(&mut self) -> Result<Arc<Snapshot>> {
        let tab = self.ensure_attached_here().await?;
        let cached = match &self.snapshot {
            Some(snapshot)
                if !self.stale
                    && self.snapshot_tab == Some(tab)
                    && self.snapshot_generation == self.control.generation() =>
            {
                Some(snapshot.clone())
            }
            _ => None,
        };
        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => self.fetch_snapshot(tab).await?,
        };

        let leaf_alive = self
            .session
            .dom
            .last()
            .map(|seg| snapshot.contains(&seg.node_id))
            .unwrap_or(false);
        if !leaf_alive {
            if self.session.dom.len() > 1 {
                info!(tab, was = %self.session.pwd(), "current node vanished, back to page root");
                self.notice = Some(format!(
                    "notice: page changed, {} no longer exists; returned to {}",
                    self.session.pwd(),
                    self.session.browser
                ));
            }
            self.session.dom = vec![root_segment(&snapshot)];
        }
        Ok(snapshot)
    }

    async fn enter_tab(&mut self, tab: &TabInfo) -> Result<Arc<Snapshot>> {
        if self.control.attached_tab().await != Some(tab.id) {
            self.control.attach(tab.id).await?;
        }
        self.session.attached = Some(tab.id);
        info!(tab = tab.id, title = %tab.title, "attached");
        self.fetch_snapshot(tab.id).await
    }

    // ---- cd ----

    async fn cd(&mut self, path: &str) -> Result<String> {
        let (absolute, rest) = split_absolute(path);
        let segments = split_path(rest);

        if !absolute && self.current_tab().is_some() {
            self.ensure_fresh().await?;
        }

        let mut browser = if absolute { BrowserPath::Root } else { self.session.browser };
        let mut dom = if absolute { Vec::new() } else { self.session.dom.clone() };
        let mut tabs: Option<Vec<TabInfo>> = None;
        let mut entered: Option<TabInfo> = None;
        let mut left_tab = false;

        for seg in segments {
            if browser.tab_id().is_some() {
                if seg == ".." {
                    if dom.len() > 1 {
                        dom.pop();
                    } else {
                        dom.clear();
                        browser = browser.parent();
                        left_tab = true;
                    }
                    continue;
                }
                let snapshot = self.snapshot.clone().ok_or(Error::NotAttached)?;
                if dom.is_empty() {
                    dom.push(root_segment(&snapshot));
                }
                let parent = dom.last().map(|s| s.node_id.clone()).unwrap_or_default();
                let entry = resolver::step(&snapshot, &parent, seg)?;
                if !entry.is_container {
                    return Err(Error::NotADirectory(entry.name));
                }
                dom.push(DomSegment {
                    name: entry.name,
                    node_id: entry.id,
                });
                continue;
            }

            let next = match (browser, seg) {
                (_, "..") => browser.parent(),
                (BrowserPath::Root, "tabs") => BrowserPath::Tabs,
                (BrowserPath::Root, "windows") => BrowserPath::Windows,
                (BrowserPath::Tabs, pattern) => {
                    let all = self.tabs_cached(&mut tabs).await?;
                    let tab = match_tab(all, pattern)
                        .ok_or_else(|| Error::NoSuchEntry(pattern.to_string()))?
                        .clone();
                    let id = tab.id;
                    entered = Some(tab);
                    BrowserPath::Tab { window: None, id }
                }
                (BrowserPath::Windows, raw) => {
                    let all = self.tabs_cached(&mut tabs).await?;
                    let w = raw
                        .parse::<i64>()
                        .ok()
                        .filter(|w| window_ids(all).contains(w))
                        .ok_or_else(|| Error::NoSuchEntry(raw.to_string()))?;
                    BrowserPath::Window(w)
                }
                (BrowserPath::Window(w), pattern) => {
                    let all = self.tabs_cached(&mut tabs).await?;
                    let in_window: Vec<TabInfo> =
                        all.iter().filter(|t| t.window_id == w).cloned().collect();
                    let tab = match_tab(&in_window, pattern)
                        .ok_or_else(|| Error::NoSuchEntry(pattern.to_string()))?
                        .clone();
                    let id = tab.id;
                    entered = Some(tab);
                    BrowserPath::Tab { window: Some(w), id }
                }
                (_, other) => return Err(Error::NoSuchEntry(other.to_string())),
            };
            browser = next;

            if let Some(tab) = entered.as_ref().filter(|t| Some(t.id) == browser.tab_id()) {
                let tab = tab.clone();
                let snapshot = self.enter_tab(&tab).await?;
                dom = vec![root_segment(&snapshot)];
            }
        }

        if browser.tab_id().is_none() && left_tab {
            if let Err(e) = self.control.detach().await {
                warn!(error = %e, "detach failed");
            }
            self.session.attached = None;
        }

        self.session.browser = browser;
        self.session.dom = dom;

        let pwd = self.session.pwd();
        match entered.filter(|t| Some(t.id) == browser.tab_id()) {
            Some(tab) => Ok(format!(
                "attached to tab {} \"{}\" ({})\n{}",
                tab.id, tab.title, tab.url, pwd
            )),
            None => Ok(pwd),
        }
    }

    async fn tabs_cached<'a>(&self, tabs: &'a mut Option<Vec<TabInfo>>) -> Result<&'a [TabInfo]> {
        if tabs.is_none() {
            *tabs = Some(self.control.list_tabs().await?);
        }
        Ok(tabs.as_deref().unwrap_or_default())
    }

    // ---- read operations ----

    /// Resolve an optional path argument against the current node. Leading
    /// `..` segments climb the DOM chain but never out of the page.
    async fn target(&mut self, path: Option<&str>) -> Result<(Arc<Snapshot>, VfsEntry)> {
        let snapshot = self.ensure_fresh().await?;
        let path = path.unwrap_or("");
        let mut segments = split_path(path);

        let mut depth = self.session.dom.len();
        while segments.first() == Some(&"..") {
            if depth <= 1 {
                return Err(Error::MalformedInput(format!("'{}' leaves the page", path)));
            }
            depth -= 1;
            segments.remove(0);
        }

        let base = &self.session.dom[..depth];
        let Some(last) = base.last() else {
            return Err(Error::NotAttached);
        };
        let entry = if segments.is_empty() {
            if depth == 1 {
                root_entry(&snapshot).ok_or_else(|| Error::NoSuchEntry(".".into()))?
            } else {
                let node = snapshot
                    .get(&last.node_id)
                    .ok_or_else(|| Error::NoSuchEntry(last.name.clone()))?;
                entry_for(&snapshot, node, last.name.clone())
            }
        } else {
            resolver::resolve(&snapshot, &last.node_id, &segments.join("/"))?
        };
        Ok((snapshot, entry))
    }

    async fn ls(&mut self, long: bool, path: Option<&str>) -> Result<String> {
        let browser_target = match path {
            Some(p) if split_absolute(p).0 => Some(self.walk_listing(BrowserPath::Root, p).await?),
            _ if self.current_tab().is_none() => {
                Some(self.walk_listing(self.session.browser, path.unwrap_or("")).await?)
            }
            _ => None,
        };
        if let Some(listing) = browser_target {
            return self.browser_listing(listing).await;
        }

        let (snapshot, entry) = self.target(path).await?;
        if !entry.is_container {
            return Ok(format_entry(&entry, long));
        }
        let children = map_children(&snapshot, &entry.id);
        if children.is_empty() {
            return Ok("(empty)".into());
        }
        Ok(children
            .iter()
            .map(|c| format_entry(c, long))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Browser-level path walk for listings; tab targets are not listable.
    async fn walk_listing(&self, start: BrowserPath, path: &str) -> Result<BrowserPath> {
        let (_, rest) = split_absolute(path);
        let mut at = start;
        for seg in split_path(rest) {
            at = match (at, seg) {
                (_, "..") => at.parent(),
                (BrowserPath::Root, "tabs") => BrowserPath::Tabs,
                (BrowserPath::Root, "windows") => BrowserPath::Windows,
                (BrowserPath::Windows, raw) => {
                    let tabs = self.control.list_tabs().await?;
                    raw.parse::<i64>()
                        .ok()
                        .filter(|w| window_ids(&tabs).contains(w))
                        .map(BrowserPath::Window)
                        .ok_or_else(|| Error::NoSuchEntry(raw.to_string()))?
                }
                (BrowserPath::Tabs | BrowserPath::Window(_), tab) => {
                    return Err(Error::MalformedInput(format!(
                        "'{}' is a tab; cd into it to list its page",
                        tab
                    )))
                }
                (_, other) => return Err(Error::NoSuchEntry(other.to_string())),
            };
        }
        Ok(at)
    }

    async fn browser_listing(&self, at: BrowserPath) -> Result<String> {
        if at == BrowserPath::Root {
            return Ok("tabs/\nwindows/".into());
        }
        let tabs = self.control.list_tabs().await?;
        let attached = self.control.attached_tab().await;
        let lines: Vec<String> = match at {
            BrowserPath::Tabs => ordered_tabs(&tabs)
                .into_iter()
                .map(|t| tab_line(t, attached))
                .collect(),
            BrowserPath::Windows => window_ids(&tabs)
                .into_iter()
                .map(|w| {
                    let count = tabs.iter().filter(|t| t.window_id == w).count();
                    format!("{}/  ({} tabs)", w, count)
                })
                .collect(),
            BrowserPath::Window(w) => tabs
                .iter()
                .filter(|t| t.window_id == w)
                .map(|t| tab_line(t, attached))
                .collect(),
            _ => Vec::new(),
        };
        if lines.is_empty() {
            return Ok("(empty)".into());
        }
        Ok(lines.join("\n"))
    }

    async fn cat(&mut self, path: &str) -> Result<String> {
        let (snapshot, entry) = self.target(Some(path)).await?;
        let mut out = vec![
            format!("name: {}", entry.name),
            format!("role: {}", entry.role),
            format!("type: {}", if entry.is_container { "directory" } else { "file" }),
        ];
        if let Some(node) = snapshot.get(&entry.id) {
            if let Some(value) = node.value.as_deref().filter(|v| !v.is_empty()) {
                out.push(format!("value: {}", value));
            }
            if let Some(desc) = node.description.as_deref().filter(|d| !d.trim().is_empty()) {
                out.push(format!("description: {}", desc.trim()));
            }
        }
        if entry.is_container {
            out.push(format!("children: {}", map_children(&snapshot, &entry.id).len()));
        }
        match entry.backend_id {
            Some(backend) => {
                let text = self.control.element_text(backend).await?;
                let text = text.trim();
                if !text.is_empty() {
                    out.push(format!("text: {}", clip(text)));
                }
            }
            None => out.push("backing element: none".into()),
        }
        Ok(out.join("\n"))
    }

    async fn text(&mut self, path: Option<&str>) -> Result<String> {
        let (snapshot, entry) = self.target(path).await?;
        let rendered = match entry.backend_id {
            Some(backend) => self.control.element_text(backend).await?,
            None => String::new(),
        };
        let text = if rendered.trim().is_empty() {
            accessible_text(&snapshot, &entry.id)
        } else {
            rendered.trim().to_string()
        };
        if text.is_empty() {
            return Ok("(no text)".into());
        }
        Ok(clip(&text))
    }

    async fn grep(&mut self, spec: &SearchSpec) -> Result<String> {
        let (snapshot, entry) = self.target(spec.path.as_deref()).await?;
        if !entry.is_container {
            return Err(Error::NotADirectory(entry.name));
        }
        let hits = search_children(&snapshot, &entry.id, spec);
        if hits.is_empty() {
            return Ok("(no matches)".into());
        }
        Ok(hits
            .iter()
            .map(|e| format_entry(e, true))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn find(&mut self, spec: &SearchSpec) -> Result<String> {
        let (snapshot, entry) = self.target(spec.path.as_deref()).await?;
        if !entry.is_container {
            return Err(Error::NotADirectory(entry.name));
        }
        let hits = search_recursive(&snapshot, &entry.id, spec);
        if hits.is_empty() {
            return Ok("(no matches)".into());
        }
        Ok(hits
            .iter()
            .map(|(path, e)| {
                let slash = if e.is_container { "/" } else { "" };
                format!("{}{}  ({})", path, slash, e.role)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn tree(&mut self, depth: usize, path: Option<&str>) -> Result<String> {
        let (snapshot, entry) = self.target(path).await?;
        Ok(render_tree(&snapshot, &entry, depth))
    }

    async fn refresh(&mut self) -> Result<String> {
        self.stale = true;
        let snapshot = self.ensure_fresh().await?;
        Ok(format!("refreshed: {} nodes\n{}", snapshot.len(), self.session.pwd()))
    }

    async fn whoami(&mut self) -> Result<String> {
        let Some(tab) = self.current_tab() else {
            return Ok(format!("not attached\npath: {}", self.session.pwd()));
        };
        self.ensure_attached_here().await?;
        let page = self.control.page_info().await?;
        let frames = self.control.frames().await?;
        Ok(format!(
            "tab: {}\ntitle: {}\nurl: {}\nframes: {}\npath: {}",
            tab,
            page.title,
            page.url,
            frames.len(),
            self.session.pwd()
        ))
    }

    fn env(&self) -> String {
        if self.session.env.is_empty() {
            return "(empty)".into();
        }
        self.session
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn cookies(&mut self) -> Result<String> {
        self.ensure_attached_here().await?;
        let cookies = self.control.cookies().await?;
        if cookies.is_empty() {
            return Ok("(no cookies)".into());
        }
        Ok(cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    // ---- page-changing operations ----

    async fn navigate(&mut self, url: &str) -> Result<String> {
        let tab = self.ensure_attached_here().await?;
        let url = normalize_url(url);
        info!(tab, url = %url, "navigate");
        self.control.navigate(&url).await?;
        let snapshot = self.fetch_snapshot(tab).await?;
        self.session.dom = vec![root_segment(&snapshot)];
        let page = self.control.page_info().await?;
        Ok(format!("navigated to {} \"{}\"\n{}", page.url, page.title, self.session.pwd()))
    }

    async fn open(&mut self, url: &str) -> Result<String> {
        let url = normalize_url(url);
        let tab = self.control.open_tab(&url).await?;
        info!(tab = tab.id, url = %url, "opened tab");
        let snapshot = self.enter_tab(&tab).await?;
        self.session.browser = BrowserPath::Tab { window: None, id: tab.id };
        self.session.dom = vec![root_segment(&snapshot)];
        Ok(format!(
            "opened tab {} \"{}\" ({})\n{}",
            tab.id,
            tab.title,
            tab.url,
            self.session.pwd()
        ))
    }

    /// Resolve a mutation target: an existing leaf with a backing element.
    async fn actionable(&mut self, path: &str) -> Result<(VfsEntry, i64)> {
        let (_, entry) = self.target(Some(path)).await?;
        if entry.is_container {
            return Err(Error::MalformedInput(format!("'{}' is a directory", entry.name)));
        }
        let backend = entry
            .backend_id
            .ok_or_else(|| Error::NoBackingElement(entry.name.clone()))?;
        Ok((entry, backend))
    }

    async fn click(&mut self, path: &str) -> Result<String> {
        let (entry, backend) = self.actionable(path).await?;
        match self.control.click(backend).await {
            Ok(()) => Ok(format!("clicked {} (element)", entry.name)),
            Err(direct) => {
                debug!(element = %entry.name, error = %direct, "direct click failed, trying coordinates");
                self.control.click_at(backend).await?;
                Ok(format!(
                    "clicked {} (coordinates; direct click failed: {})",
                    entry.name, direct
                ))
            }
        }
    }

    async fn focus(&mut self, path: &str) -> Result<String> {
        let (entry, backend) = self.actionable(path).await?;
        self.control.focus(backend).await?;
        Ok(format!("focused {}", entry.name))
    }

    async fn type_text(&mut self, path: &str, text: &str) -> Result<String> {
        let (entry, backend) = self.actionable(path).await?;
        self.control.focus(backend).await?;
        self.control.type_text(backend, text).await?;
        Ok(format!("typed {} characters into {}", text.chars().count(), entry.name))
    }
}

fn root_segment(snapshot: &Snapshot) -> DomSegment {
    DomSegment {
        name: String::new(),
        node_id: snapshot.root_id().to_string(),
    }
}

/// `~/x` and `/x` are absolute; returns the remainder after the marker.
fn split_absolute(path: &str) -> (bool, &str) {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix('~') {
        (true, rest)
    } else if path.starts_with('/') {
        (true, path)
    } else {
        (false, path)
    }
}

fn format_entry(entry: &VfsEntry, long: bool) -> String {
    if !long {
        return entry.display_name();
    }
    let kind = if entry.is_container { 'd' } else { '-' };
    let mut line = format!("{} {:<12} {}", kind, entry.role, entry.display_name());
    if let Some(preview) = &entry.preview {
        line.push_str(&format!("  \"{}\"", preview));
    }
    line
}

fn tab_line(tab: &TabInfo, attached: Option<i64>) -> String {
    let marker = if attached == Some(tab.id) { "*" } else { " " };
    format!("{}{:<4} {}  {}", marker, tab.id, tab.title, tab.url)
}

fn clip(text: &str) -> String {
    let cut = safe_truncate(text, MAX_TEXT_CHARS);
    if cut.len() < text.len() {
        format!("{}\n... (truncated)", cut)
    } else {
        cut.to_string()
    }
}

/// Concatenated static text below `id`, in document order.
fn accessible_text(snapshot: &Snapshot, id: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = vec![id];
    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        let Some(node) = snapshot.get(current) else {
            continue;
        };
        if node.role == "StaticText" {
            if let Some(label) = node.label() {
                parts.push(label);
            }
        }
        for child in node.child_ids.iter().rev() {
            stack.push(child.as_str());
        }
    }
    parts.join(" ")
}

/// Bare hosts get an `https://` scheme; `about:` and `data:` URLs pass through.
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") || url.starts_with("about:") || url.starts_with("data:") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}
