//! Accessibility snapshot → virtual filesystem entries.
//!
//! Structurally insignificant nodes are flattened away, the rest become
//! directory-like containers or leaves with deterministic, sibling-unique
//! names (`submit_btn`, `submit_btn_2`, `search_input`, ...).

use std::collections::{HashMap, HashSet};

use domshell_core::{safe_truncate, AxNode};

/// Maximum characters taken from an accessible name when building a slug.
pub const MAX_SLUG_CHARS: usize = 40;

/// Maximum characters of a value shown in listings.
pub const MAX_PREVIEW_CHARS: usize = 40;

/// Roles that never carry meaning of their own; always flattened.
const STRUCTURAL_ROLES: &[&str] = &[
    "none", "presentation", "InlineTextBox", "LineBreak", "ignored",
];

/// Roles flattened when the node has no accessible name.
const GENERIC_ROLES: &[&str] = &[
    "generic", "GenericContainer", "group", "Section", "div", "span", "Div", "paragraph",
];

/// Roles that are always directories.
const CONTAINER_ROLES: &[&str] = &[
    "RootWebArea", "WebArea", "document", "main", "navigation", "banner",
    "contentinfo", "complementary", "region", "form", "search", "article",
    "section", "list", "listbox", "table", "grid", "treegrid", "row", "rowgroup",
    "tablist", "tabpanel", "menu", "menubar", "tree", "dialog", "alertdialog",
    "toolbar", "radiogroup", "figure", "Iframe", "IframePresentational",
];

/// Interactive roles; always leaves, even when the tree gives them children.
const LEAF_ROLES: &[&str] = &[
    "button", "link", "textbox", "searchbox", "combobox", "checkbox", "radio",
    "switch", "slider", "spinbutton", "menuitem", "menuitemcheckbox",
    "menuitemradio", "option", "tab", "treeitem", "textField", "TextField",
    "PopUpButton", "image", "img",
];

/// Raw text carriers. They never make their parent a directory on their own.
const TEXT_ROLES: &[&str] = &["StaticText", "InlineTextBox", "LineBreak", "text"];

fn role_in(role: &str, set: &[&str]) -> bool {
    set.iter().any(|r| r.eq_ignore_ascii_case(role))
}

/// Suffix token that lets callers infer interactivity from a name alone.
fn role_suffix(role: &str) -> Option<&'static str> {
    let suffix = match role.to_ascii_lowercase().as_str() {
        "button" | "popupbutton" => "btn",
        "link" => "link",
        "textbox" | "searchbox" | "textfield" => "input",
        "combobox" => "select",
        "checkbox" | "menuitemcheckbox" => "chk",
        "radio" | "menuitemradio" => "radio",
        "switch" => "switch",
        "slider" => "slider",
        "spinbutton" => "spin",
        "menuitem" => "item",
        "option" => "opt",
        "tab" => "tab",
        "image" | "img" => "img",
        "heading" => "heading",
        _ => return None,
    };
    Some(suffix)
}

/// Full node set of one page, keyed by node id. Replaced wholesale on refresh.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: HashMap<String, AxNode>,
    root_id: String,
}

impl Snapshot {
    /// Build from the collaborator's node list. The root is the first node that
    /// no other node lists as a child.
    pub fn new(nodes: Vec<AxNode>) -> Self {
        let referenced: HashSet<&str> = nodes
            .iter()
            .flat_map(|n| n.child_ids.iter().map(String::as_str))
            .collect();
        let root_id = nodes
            .iter()
            .find(|n| !referenced.contains(n.id.as_str()))
            .or_else(|| nodes.first())
            .map(|n| n.id.clone())
            .unwrap_or_default();

        let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self { nodes, root_id }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn get(&self, id: &str) -> Option<&AxNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One addressable entry of the virtual filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct VfsEntry {
    /// Source accessibility node id.
    pub id: String,
    pub name: String,
    pub role: String,
    pub is_container: bool,
    pub backend_id: Option<i64>,
    pub preview: Option<String>,
}

impl VfsEntry {
    /// Name as shown in listings: directories carry a trailing slash.
    pub fn display_name(&self) -> String {
        if self.is_container {
            format!("{}/", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// A node whose children are spliced into its parent's listing.
pub fn is_transparent(node: &AxNode) -> bool {
    node.ignored
        || role_in(&node.role, STRUCTURAL_ROLES)
        || (role_in(&node.role, GENERIC_ROLES) && node.label().is_none())
}

/// Visible children of `parent_id` after flattening, in document order.
pub fn visible_children<'a>(snapshot: &'a Snapshot, parent_id: &str) -> Vec<&'a AxNode> {
    let mut out = Vec::new();
    let Some(parent) = snapshot.get(parent_id) else {
        return out;
    };

    let mut visited: HashSet<&str> = HashSet::new();
    visited.insert(parent.id.as_str());
    let mut stack = vec![parent.child_ids.iter()];

    loop {
        let Some(top) = stack.last_mut() else { break };
        let Some(child_id) = top.next() else {
            stack.pop();
            continue;
        };
        if !visited.insert(child_id.as_str()) {
            continue;
        }
        let Some(child) = snapshot.get(child_id) else {
            continue;
        };
        if is_transparent(child) {
            stack.push(child.child_ids.iter());
        } else {
            out.push(child);
        }
    }
    out
}

/// Directory or leaf. Explicit roles win; otherwise any non-text visible child
/// makes a directory.
pub fn is_container(snapshot: &Snapshot, node: &AxNode) -> bool {
    if role_in(&node.role, CONTAINER_ROLES) {
        return true;
    }
    if role_in(&node.role, LEAF_ROLES) || role_in(&node.role, TEXT_ROLES) {
        return false;
    }
    visible_children(snapshot, &node.id)
        .iter()
        .any(|c| !role_in(&c.role, TEXT_ROLES))
}

/// Lowercase, non-alphanumerics collapsed to single `_`, bounded length.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    let mut pending_sep = false;
    for ch in s.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch);
        } else {
            pending_sep = true;
        }
    }
    safe_truncate(&slug, MAX_SLUG_CHARS)
        .trim_end_matches('_')
        .to_string()
}

/// Name before sibling de-duplication.
fn base_name(node: &AxNode) -> String {
    let from_text = node
        .label()
        .map(slugify)
        .filter(|s| !s.is_empty())
        .or_else(|| node.description.as_deref().map(slugify).filter(|s| !s.is_empty()));

    match from_text {
        Some(slug) => match role_suffix(&node.role) {
            Some(suffix) => format!("{}_{}", slug, suffix),
            None => slug,
        },
        None => {
            let role = slugify(&node.role);
            let role = if role.is_empty() { "node".to_string() } else { role };
            format!("{}_{}", role, node.id.replace('/', "_"))
        }
    }
}

fn preview(node: &AxNode) -> Option<String> {
    let value = node.value.as_deref().map(str::trim).filter(|v| !v.is_empty())?;
    let cut = safe_truncate(value, MAX_PREVIEW_CHARS);
    if cut.len() < value.len() {
        Some(format!("{}...", cut))
    } else {
        Some(value.to_string())
    }
}

/// Build the entry for one node under an already-chosen name.
pub fn entry_for(snapshot: &Snapshot, node: &AxNode, name: String) -> VfsEntry {
    VfsEntry {
        id: node.id.clone(),
        name,
        role: node.role.clone(),
        is_container: is_container(snapshot, node),
        backend_id: node.backend_id,
        preview: preview(node),
    }
}

/// Entry representing the page itself.
pub fn root_entry(snapshot: &Snapshot) -> Option<VfsEntry> {
    let root = snapshot.get(snapshot.root_id())?;
    let mut entry = entry_for(snapshot, root, ".".to_string());
    entry.is_container = true;
    Some(entry)
}

/// The visible children of `parent_id` as entries, with unique names.
pub fn map_children(snapshot: &Snapshot, parent_id: &str) -> Vec<VfsEntry> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut next_suffix: HashMap<String, usize> = HashMap::new();

    visible_children(snapshot, parent_id)
        .into_iter()
        .map(|node| {
            let base = base_name(node);
            let name = if taken.insert(base.clone()) {
                base
            } else {
                let counter = next_suffix.entry(base.clone()).or_insert(1);
                loop {
                    *counter += 1;
                    let candidate = format!("{}_{}", base, counter);
                    if taken.insert(candidate.clone()) {
                        break candidate;
                    }
                }
            };
            entry_for(snapshot, node, name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(nodes: Vec<AxNode>) -> Snapshot {
        Snapshot::new(nodes)
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Submit"), "submit");
        assert_eq!(slugify("  Sign in / Register!  "), "sign_in_register");
        assert_eq!(slugify("---"), "");
        let long = "a".repeat(100);
        assert_eq!(slugify(&long).len(), MAX_SLUG_CHARS);
    }

    #[test]
    fn test_duplicate_buttons_get_numeric_suffix() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2", "3"]),
            AxNode::new("2", "button").with_name("Submit").with_backend(20),
            AxNode::new("3", "button").with_name("Submit").with_backend(30),
        ]);
        let names: Vec<String> = map_children(&snap, "1").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["submit_btn", "submit_btn_2"]);
    }

    #[test]
    fn test_generated_suffix_never_collides_with_natural_name() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2", "3", "4"]),
            AxNode::new("2", "link").with_name("More"),
            AxNode::new("3", "link").with_name("More 2"),
            AxNode::new("4", "link").with_name("More"),
        ]);
        let names: Vec<String> = map_children(&snap, "1").into_iter().map(|e| e.name).collect();
        assert_eq!(names[0], "more_link");
        assert_eq!(names[1], "more_2_link");
        assert_eq!(names[2], "more_link_2");
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_flattening_generic_and_ignored() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2", "5"]),
            AxNode::new("2", "generic").with_children(["3", "4"]),
            AxNode::new("3", "link").with_name("Home"),
            AxNode::new("4", "none").with_children(["6"]),
            AxNode::new("6", "button").with_name("Go"),
            AxNode::new("5", "heading").with_name("Title").ignored(),
        ]);
        let names: Vec<String> = map_children(&snap, "1").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["home_link", "go_btn"]);
    }

    #[test]
    fn test_named_generic_is_kept() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2"]),
            AxNode::new("2", "group").with_name("Filters").with_children(["3"]),
            AxNode::new("3", "checkbox").with_name("In stock"),
        ]);
        let entries = map_children(&snap, "1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "filters");
        assert!(entries[0].is_container);
    }

    #[test]
    fn test_cycle_is_guarded() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2"]),
            AxNode::new("2", "generic").with_children(["3"]),
            AxNode::new("3", "generic").with_children(["2", "4"]),
            AxNode::new("4", "link").with_name("Loop"),
        ]);
        let entries = map_children(&snap, "1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "loop_link");
    }

    #[test]
    fn test_classification() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2", "3", "5", "7"]),
            AxNode::new("2", "navigation").with_name("Nav"),
            AxNode::new("3", "button").with_name("Menu").with_children(["4"]),
            AxNode::new("4", "image").with_name("icon"),
            AxNode::new("5", "listitem").with_children(["6"]),
            AxNode::new("6", "link").with_name("Docs"),
            AxNode::new("7", "paragraph").with_name("Intro").with_children(["8"]),
            AxNode::new("8", "StaticText").with_name("Intro"),
        ]);
        let entries = map_children(&snap, "1");
        let by_name: HashMap<&str, &VfsEntry> =
            entries.iter().map(|e| (e.name.as_str(), e)).collect();
        assert!(by_name["nav"].is_container, "explicit structural role");
        assert!(!by_name["menu_btn"].is_container, "interactive roles are leaves");
        assert!(by_name["listitem_5"].is_container, "has a non-text child");
        assert!(!by_name["intro"].is_container, "text-only children keep it a leaf");
    }

    #[test]
    fn test_name_fallbacks() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2", "3"]),
            AxNode::new("2", "textbox").with_description("Email address").with_value("a@b.c"),
            AxNode::new("3", "button"),
        ]);
        let entries = map_children(&snap, "1");
        assert_eq!(entries[0].name, "email_address_input");
        assert_eq!(entries[0].preview.as_deref(), Some("a@b.c"));
        assert_eq!(entries[1].name, "button_3");
    }

    #[test]
    fn test_flattening_is_idempotent() {
        let snap = page(vec![
            AxNode::new("1", "RootWebArea").with_children(["2", "9"]),
            AxNode::new("2", "generic").with_children(["3", "4"]),
            AxNode::new("3", "navigation").with_name("Nav").with_children(["5"]),
            AxNode::new("5", "generic").with_children(["6", "7"]),
            AxNode::new("6", "link").with_name("Home"),
            AxNode::new("7", "link").with_name("Home"),
            AxNode::new("4", "button").with_name("Submit"),
            AxNode::new("9", "none").with_children(["10"]),
            AxNode::new("10", "textbox").with_name("Query"),
        ]);

        // Rebuild a node set containing only what the mapper exposes.
        let mut flat = Vec::new();
        let mut queue = vec![snap.root_id().to_string()];
        while let Some(id) = queue.pop() {
            let node = snap.get(&id).unwrap();
            let kids: Vec<String> =
                visible_children(&snap, &id).iter().map(|n| n.id.clone()).collect();
            queue.extend(kids.iter().cloned());
            let mut copy = node.clone();
            copy.child_ids = kids;
            flat.push(copy);
        }
        let flat = page(flat);

        for id in ["1", "3"] {
            assert_eq!(map_children(&snap, id), map_children(&flat, id));
        }
    }

    #[test]
    fn test_root_detection_ignores_node_order() {
        let snap = page(vec![
            AxNode::new("2", "link").with_name("x"),
            AxNode::new("1", "RootWebArea").with_children(["2"]),
        ]);
        assert_eq!(snap.root_id(), "1");
        assert_eq!(root_entry(&snap).unwrap().name, ".");
    }
}
