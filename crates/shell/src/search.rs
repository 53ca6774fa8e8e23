//! Child search, recursive search and tree rendering over mapped entries.

use std::collections::HashSet;

use crate::command::SearchSpec;
use crate::mapper::{map_children, Snapshot, VfsEntry};

/// Upper bound on lines produced by `tree`.
const MAX_TREE_LINES: usize = 500;

/// Case-insensitive match on name, role or value preview, optionally
/// restricted to one role.
pub fn entry_matches(entry: &VfsEntry, needle: &str, role: Option<&str>) -> bool {
    if let Some(role) = role {
        if !entry.role.eq_ignore_ascii_case(role) {
            return false;
        }
    }
    let needle = needle.to_lowercase();
    entry.name.to_lowercase().contains(&needle)
        || entry.role.to_lowercase().contains(&needle)
        || entry
            .preview
            .as_deref()
            .map(|p| p.to_lowercase().contains(&needle))
            .unwrap_or(false)
}

/// Direct children of `parent_id` matching the spec.
pub fn search_children(snapshot: &Snapshot, parent_id: &str, spec: &SearchSpec) -> Vec<VfsEntry> {
    let mut hits: Vec<VfsEntry> = map_children(snapshot, parent_id)
        .into_iter()
        .filter(|e| entry_matches(e, &spec.pattern, spec.role.as_deref()))
        .collect();
    if let Some(limit) = spec.limit {
        hits.truncate(limit);
    }
    hits
}

/// Depth-first search below `parent_id`, returning `(relative_path, entry)`
/// in document order. Stops as soon as `spec.limit` matches were found.
pub fn search_recursive(
    snapshot: &Snapshot,
    parent_id: &str,
    spec: &SearchSpec,
) -> Vec<(String, VfsEntry)> {
    let mut hits = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(parent_id.to_string());

    // (path prefix, entry), pushed in reverse so siblings pop in order
    let mut stack: Vec<(String, VfsEntry)> = map_children(snapshot, parent_id)
        .into_iter()
        .rev()
        .map(|e| (String::new(), e))
        .collect();

    while let Some((prefix, entry)) = stack.pop() {
        if !visited.insert(entry.id.clone()) {
            continue;
        }
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };

        if entry_matches(&entry, &spec.pattern, spec.role.as_deref()) {
            if spec.limit.map(|l| hits.len() >= l).unwrap_or(false) {
                break;
            }
            hits.push((path.clone(), entry.clone()));
        }
        if entry.is_container {
            for child in map_children(snapshot, &entry.id).into_iter().rev() {
                stack.push((path.clone(), child));
            }
        }
    }
    hits
}

/// Indented subtree of `root`, `depth` levels deep.
pub fn render_tree(snapshot: &Snapshot, root: &VfsEntry, depth: usize) -> String {
    let mut lines = vec![root.display_name()];
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(root.id.clone());

    let mut stack: Vec<(usize, VfsEntry)> = map_children(snapshot, &root.id)
        .into_iter()
        .rev()
        .map(|e| (1, e))
        .collect();

    while let Some((level, entry)) = stack.pop() {
        if !visited.insert(entry.id.clone()) {
            continue;
        }
        if lines.len() >= MAX_TREE_LINES {
            lines.push("... (truncated)".to_string());
            break;
        }
        let mut line = format!("{}{}", "  ".repeat(level), entry.display_name());
        if !entry.is_container {
            if let Some(preview) = &entry.preview {
                line.push_str(&format!(" = \"{}\"", preview));
            }
        }
        lines.push(line);

        if entry.is_container && level < depth {
            for child in map_children(snapshot, &entry.id).into_iter().rev() {
                stack.push((level + 1, child));
            }
        }
    }
    lines.join("\n")
}
