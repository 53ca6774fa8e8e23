//! Path algebra over mapped entries plus the browser-level address space.

use std::fmt;

use domshell_core::{Error, Result, TabInfo};

use crate::mapper::{map_children, Snapshot, VfsEntry};

/// Browser-level prefix of a namespace path. Never carries node ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserPath {
    #[default]
    Root,
    Tabs,
    Windows,
    Window(i64),
    /// A tab reached via `tabs/<id>` (`window: None`) or `windows/<w>/<id>`.
    Tab { window: Option<i64>, id: i64 },
}

impl BrowserPath {
    pub fn segments(&self) -> Vec<String> {
        match *self {
            BrowserPath::Root => vec![],
            BrowserPath::Tabs => vec!["tabs".into()],
            BrowserPath::Windows => vec!["windows".into()],
            BrowserPath::Window(w) => vec!["windows".into(), w.to_string()],
            BrowserPath::Tab { window: None, id } => vec!["tabs".into(), id.to_string()],
            BrowserPath::Tab { window: Some(w), id } => {
                vec!["windows".into(), w.to_string(), id.to_string()]
            }
        }
    }

    /// One level up. The parent of a tab is the listing it was entered from.
    pub fn parent(&self) -> BrowserPath {
        match *self {
            BrowserPath::Root | BrowserPath::Tabs | BrowserPath::Windows => BrowserPath::Root,
            BrowserPath::Window(_) => BrowserPath::Windows,
            BrowserPath::Tab { window: None, .. } => BrowserPath::Tabs,
            BrowserPath::Tab { window: Some(w), .. } => BrowserPath::Window(w),
        }
    }

    pub fn tab_id(&self) -> Option<i64> {
        match *self {
            BrowserPath::Tab { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for BrowserPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~")?;
        for seg in self.segments() {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

/// Split a relative path into meaningful segments (`.` and empties dropped).
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

/// Find one child of `parent_id` by name: exact first, then case-insensitive.
pub fn step(snapshot: &Snapshot, parent_id: &str, segment: &str) -> Result<VfsEntry> {
    let mut children = map_children(snapshot, parent_id);
    if let Some(pos) = children.iter().position(|e| e.name == segment) {
        return Ok(children.swap_remove(pos));
    }
    children
        .into_iter()
        .find(|e| e.name.eq_ignore_ascii_case(segment))
        .ok_or_else(|| Error::NoSuchEntry(segment.to_string()))
}

/// Resolve a relative path, returning the entry for every segment walked.
/// Fails fast on the first unmatched segment or on a leaf with path left over.
pub fn resolve_steps(snapshot: &Snapshot, from_id: &str, path: &str) -> Result<Vec<VfsEntry>> {
    let segments = split_path(path);
    let mut walked: Vec<VfsEntry> = Vec::with_capacity(segments.len());
    let mut parent = from_id.to_string();

    for (i, segment) in segments.iter().enumerate() {
        if *segment == ".." {
            return Err(Error::MalformedInput(format!(
                "'..' is not allowed inside '{}'",
                path
            )));
        }
        let entry = step(snapshot, &parent, segment)?;
        if i + 1 < segments.len() && !entry.is_container {
            return Err(Error::NotADirectory(entry.name));
        }
        parent = entry.id.clone();
        walked.push(entry);
    }
    Ok(walked)
}

/// Resolve a relative path to a single entry.
pub fn resolve(snapshot: &Snapshot, from_id: &str, path: &str) -> Result<VfsEntry> {
    resolve_steps(snapshot, from_id, path)?
        .pop()
        .ok_or_else(|| Error::NoSuchEntry(path.to_string()))
}

/// Window ids in first-seen order.
pub fn window_ids(tabs: &[TabInfo]) -> Vec<i64> {
    let mut ids = Vec::new();
    for tab in tabs {
        if !ids.contains(&tab.window_id) {
            ids.push(tab.window_id);
        }
    }
    ids
}

/// Tabs grouped window-then-tab, preserving order within each window.
pub fn ordered_tabs(tabs: &[TabInfo]) -> Vec<&TabInfo> {
    window_ids(tabs)
        .into_iter()
        .flat_map(|w| tabs.iter().filter(move |t| t.window_id == w))
        .collect()
}

/// Pick a tab by exact numeric id, else by case-insensitive substring of its
/// title or URL. First match in window-then-tab order wins.
pub fn match_tab<'a>(tabs: &'a [TabInfo], pattern: &str) -> Option<&'a TabInfo> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    if let Ok(id) = pattern.parse::<i64>() {
        if let Some(tab) = tabs.iter().find(|t| t.id == id) {
            return Some(tab);
        }
    }
    let needle = pattern.to_lowercase();
    ordered_tabs(tabs).into_iter().find(|t| {
        t.title.to_lowercase().contains(&needle) || t.url.to_lowercase().contains(&needle)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use domshell_core::AxNode;

    fn tab(id: i64, window_id: i64, title: &str, url: &str) -> TabInfo {
        TabInfo {
            id,
            window_id,
            title: title.into(),
            url: url.into(),
            active: false,
        }
    }

    fn site() -> Snapshot {
        Snapshot::new(vec![
            AxNode::new("1", "RootWebArea").with_children(["2", "5"]),
            AxNode::new("2", "navigation").with_name("Nav").with_children(["3", "4"]),
            AxNode::new("3", "list").with_name("Links").with_children(["6"]),
            AxNode::new("6", "link").with_name("About"),
            AxNode::new("4", "link").with_name("Home"),
            AxNode::new("5", "button").with_name("Submit").with_backend(50),
        ])
    }

    #[test]
    fn test_step_exact_then_case_insensitive() {
        let snap = site();
        assert_eq!(step(&snap, "1", "nav").unwrap().id, "2");
        assert_eq!(step(&snap, "1", "NAV").unwrap().id, "2");
        assert!(matches!(step(&snap, "1", "footer"), Err(Error::NoSuchEntry(_))));
    }

    #[test]
    fn test_prefix_resolution_matches_full_path() {
        let snap = site();
        let full = resolve(&snap, "1", "nav/links/about_link").unwrap();

        let mut current = "1".to_string();
        let mut last = None;
        for seg in ["nav", "links", "about_link"] {
            let e = resolve(&snap, &current, seg).unwrap();
            current = e.id.clone();
            last = Some(e);
        }
        assert_eq!(last.unwrap(), full);

        let steps = resolve_steps(&snap, "1", "nav/links/about_link").unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps.last().unwrap(), &full);
    }

    #[test]
    fn test_leaf_with_remaining_path_fails_fast() {
        let snap = site();
        let err = resolve(&snap, "1", "submit_btn/anything").unwrap_err();
        assert!(matches!(err, Error::NotADirectory(ref n) if n == "submit_btn"));
        let err = resolve(&snap, "1", "nav/missing/about_link").unwrap_err();
        assert!(matches!(err, Error::NoSuchEntry(ref n) if n == "missing"));
    }

    #[test]
    fn test_split_path_ignores_dots_and_slashes() {
        assert_eq!(split_path("./nav//links/"), vec!["nav", "links"]);
    }

    #[test]
    fn test_match_tab() {
        let tabs = vec![
            tab(7, 2, "Example Domain", "https://example.com/"),
            tab(3, 1, "GitHub", "https://github.com/"),
            tab(9, 1, "Example docs", "https://docs.example.org/"),
        ];
        assert_eq!(match_tab(&tabs, "7").unwrap().id, 7);
        assert_eq!(match_tab(&tabs, "github").unwrap().id, 3);
        // window 2 was seen first, so its tab wins the substring race
        assert_eq!(match_tab(&tabs, "example").unwrap().id, 7);
        assert!(match_tab(&tabs, "nothing-here").is_none());
        assert!(match_tab(&tabs, "").is_none());
    }

    #[test]
    fn test_browser_path_display_and_parent() {
        let p = BrowserPath::Tab { window: Some(3), id: 8 };
        assert_eq!(p.to_string(), "~/windows/3/8");
        assert_eq!(p.parent(), BrowserPath::Window(3));
        assert_eq!(BrowserPath::Tab { window: None, id: 7 }.to_string(), "~/tabs/7");
        assert_eq!(BrowserPath::Root.to_string(), "~");
        assert_eq!(BrowserPath::Tabs.parent(), BrowserPath::Root);
    }
}
