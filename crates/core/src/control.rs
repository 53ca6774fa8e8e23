//! The DOM-control collaborator: everything the shell needs from a live browser.
//!
//! The shell never talks to a browser directly. It goes through [`DomControl`],
//! implemented over CDP by `domshell-browser` and by an in-memory mock in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One raw accessibility node as reported by the browser.
///
/// Node ids are unique across frames: the collaborator prefixes ids from
/// child frames before handing the merged set out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxNode {
    pub id: String,
    pub role: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub value: Option<String>,
    pub child_ids: Vec<String>,
    pub ignored: bool,
    /// Backing DOM element handle (CDP `backendDOMNodeId`).
    pub backend_id: Option<i64>,
}

impl AxNode {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            name: None,
            description: None,
            value: None,
            child_ids: Vec::new(),
            ignored: false,
            backend_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_children<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.child_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backend(mut self, backend_id: i64) -> Self {
        self.backend_id = Some(backend_id);
        self
    }

    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    /// Accessible name, treating blank strings as absent.
    pub fn label(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: i64,
    pub window_id: i64,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub id: String,
    pub parent_id: Option<String>,
    pub url: String,
}

/// Browser-control surface consumed by the navigation kernel.
///
/// There is one shared attachment: `attach` implicitly detaches whatever
/// tab was attached before. Calls made while the underlying connection is
/// down fail with `Error::NotAttached`.
#[async_trait]
pub trait DomControl: Send + Sync {
    /// All tabs, windows first then tabs within each window.
    async fn list_tabs(&self) -> Result<Vec<TabInfo>>;

    /// Tab currently attached on the shared connection.
    async fn attached_tab(&self) -> Option<i64>;

    async fn attach(&self, tab_id: i64) -> Result<()>;

    async fn detach(&self) -> Result<()>;

    /// Full accessibility node set of the attached page, frames merged in.
    async fn snapshot(&self) -> Result<Vec<AxNode>>;

    /// Direct element action (`element.click()`).
    async fn click(&self, backend_id: i64) -> Result<()>;

    /// Simulated mouse press/release at the element's center.
    async fn click_at(&self, backend_id: i64) -> Result<()>;

    async fn focus(&self, backend_id: i64) -> Result<()>;

    /// Key-by-key input into the element.
    async fn type_text(&self, backend_id: i64, text: &str) -> Result<()>;

    /// Rendered text of the element.
    async fn element_text(&self, backend_id: i64) -> Result<String>;

    async fn page_info(&self) -> Result<PageInfo>;

    async fn frames(&self) -> Result<Vec<FrameInfo>>;

    /// Navigate the attached tab and wait for load, bounded by a fixed timeout.
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn open_tab(&self, url: &str) -> Result<TabInfo>;

    async fn cookies(&self) -> Result<Vec<(String, String)>>;

    /// Page-change counter. Bumped on frame navigation, load completion and
    /// document replacement of the attached tab.
    fn generation(&self) -> u64;
}
