//! Decoding of CDP accessibility, frame and box-model payloads.

use domshell_core::{AxNode, FrameInfo};
use serde_json::Value;

/// Convert an `Accessibility.getFullAXTree` result into nodes. Every id
/// (own and child) gets `prefix` prepended so that frames can be merged.
pub fn parse_ax_nodes(response: &Value, prefix: &str) -> Vec<AxNode> {
    let Some(nodes) = response.get("nodes").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    nodes
        .iter()
        .filter_map(|node| {
            let id = node.get("nodeId").and_then(|v| v.as_str())?;
            let child_ids = node
                .get("childIds")
                .and_then(|v| v.as_array())
                .map(|ids| {
                    ids.iter()
                        .filter_map(|c| c.as_str())
                        .map(|c| format!("{}{}", prefix, c))
                        .collect()
                })
                .unwrap_or_default();
            Some(AxNode {
                id: format!("{}{}", prefix, id),
                role: get_ax_value(node, "role").unwrap_or_else(|| "unknown".into()),
                name: get_ax_value(node, "name"),
                description: get_ax_value(node, "description"),
                value: get_ax_value(node, "value"),
                child_ids,
                ignored: node.get("ignored").and_then(|v| v.as_bool()).unwrap_or(false),
                backend_id: node.get("backendDOMNodeId").and_then(|v| v.as_i64()),
            })
        })
        .collect()
}

/// CDP wraps role/name/value/description as `{type, value}`; values may be
/// strings, numbers or booleans.
fn get_ax_value(node: &Value, field: &str) -> Option<String> {
    let raw = node.get(field)?;
    let value = raw.get("value").unwrap_or(raw);
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Frames of a `Page.getFrameTree` result in document order, main frame first.
pub fn flatten_frame_tree(response: &Value) -> Vec<FrameInfo> {
    let mut frames = Vec::new();
    let mut stack: Vec<&Value> = response.get("frameTree").into_iter().collect();
    while let Some(tree) = stack.pop() {
        if let Some(frame) = tree.get("frame") {
            let id = frame.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            frames.push(FrameInfo {
                id: id.to_string(),
                parent_id: frame
                    .get("parentId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                url: frame
                    .get("url")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if let Some(children) = tree.get("childFrames").and_then(|v| v.as_array()) {
            stack.extend(children.iter().rev());
        }
    }
    frames
}

/// Center of the content quad of a `DOM.getBoxModel` result.
pub fn extract_center_from_box_model(bm: &Value) -> Option<(f64, f64)> {
    let content = bm.get("model")?.get("content")?.as_array()?;
    if content.len() < 8 {
        return None;
    }
    let x1 = content[0].as_f64()?;
    let y1 = content[1].as_f64()?;
    let x2 = content[4].as_f64()?;
    let y2 = content[5].as_f64()?;
    Some(((x1 + x2) / 2.0, (y1 + y2) / 2.0))
}

/// Splice a frame's nodes under the node owning the frame. Returns false, and
/// drops the frame, when the owner is not part of `nodes`.
pub fn merge_frame(nodes: &mut Vec<AxNode>, owner_backend_id: i64, frame_nodes: Vec<AxNode>) -> bool {
    let Some(frame_root) = frame_nodes.first().map(|n| n.id.clone()) else {
        return false;
    };
    let Some(owner) = nodes
        .iter_mut()
        .find(|n| n.backend_id == Some(owner_backend_id))
    else {
        return false;
    };
    owner.child_ids.push(frame_root);
    nodes.extend(frame_nodes);
    true
}

/// `keyDown`/`keyUp` params for one typed character.
pub fn key_event_params(kind: &str, ch: char) -> Value {
    let (key, text) = match ch {
        '\n' | '\r' => ("Enter".to_string(), "\r".to_string()),
        '\t' => ("Tab".to_string(), "\t".to_string()),
        c => (c.to_string(), c.to_string()),
    };
    let mut params = serde_json::json!({ "type": kind, "key": key });
    if kind == "keyDown" {
        params["text"] = Value::String(text);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> Value {
        json!({
            "nodes": [
                {
                    "nodeId": "1",
                    "ignored": false,
                    "role": {"type": "role", "value": "RootWebArea"},
                    "name": {"type": "computedString", "value": "Example"},
                    "childIds": ["2", "3"],
                    "backendDOMNodeId": 10
                },
                {
                    "nodeId": "2",
                    "ignored": false,
                    "role": {"type": "role", "value": "slider"},
                    "name": {"type": "computedString", "value": ""},
                    "value": {"type": "number", "value": 42},
                    "childIds": [],
                    "backendDOMNodeId": 11
                },
                {
                    "nodeId": "3",
                    "ignored": true,
                    "role": {"type": "role", "value": "Iframe"},
                    "childIds": [],
                    "backendDOMNodeId": 12
                }
            ]
        })
    }

    #[test]
    fn test_parse_ax_nodes() {
        let nodes = parse_ax_nodes(&tree(), "");
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].role, "RootWebArea");
        assert_eq!(nodes[0].name.as_deref(), Some("Example"));
        assert_eq!(nodes[0].child_ids, vec!["2", "3"]);
        assert_eq!(nodes[1].name, None);
        assert_eq!(nodes[1].value.as_deref(), Some("42"));
        assert!(nodes[2].ignored);
        assert_eq!(nodes[2].backend_id, Some(12));
    }

    #[test]
    fn test_frame_merge_prefixes_and_splices() {
        let mut nodes = parse_ax_nodes(&tree(), "");
        let frame = parse_ax_nodes(&tree(), "f1:");
        assert_eq!(frame[0].id, "f1:1");
        assert_eq!(frame[0].child_ids, vec!["f1:2", "f1:3"]);

        assert!(merge_frame(&mut nodes, 12, frame));
        assert_eq!(nodes.len(), 6);
        let iframe = nodes.iter().find(|n| n.id == "3").unwrap();
        assert_eq!(iframe.child_ids, vec!["f1:1"]);

        assert!(!merge_frame(&mut nodes, 999, parse_ax_nodes(&tree(), "f2:")));
        assert_eq!(nodes.len(), 6);
    }

    #[test]
    fn test_flatten_frame_tree() {
        let response = json!({
            "frameTree": {
                "frame": {"id": "main", "url": "https://example.com/"},
                "childFrames": [
                    {"frame": {"id": "a", "parentId": "main", "url": "https://ads.example.com/"},
                     "childFrames": [{"frame": {"id": "a1", "parentId": "a", "url": "about:blank"}}]},
                    {"frame": {"id": "b", "parentId": "main", "url": "https://example.com/embed"}}
                ]
            }
        });
        let frames = flatten_frame_tree(&response);
        let ids: Vec<&str> = frames.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["main", "a", "a1", "b"]);
        assert_eq!(frames[0].parent_id, None);
        assert_eq!(frames[2].parent_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_box_model_center() {
        let bm = json!({"model": {"content": [10.0, 20.0, 30.0, 20.0, 30.0, 60.0, 10.0, 60.0]}});
        assert_eq!(extract_center_from_box_model(&bm), Some((20.0, 40.0)));
        assert_eq!(extract_center_from_box_model(&json!({})), None);
    }

    #[test]
    fn test_key_event_params() {
        let down = key_event_params("keyDown", 'a');
        assert_eq!(down["key"], json!("a"));
        assert_eq!(down["text"], json!("a"));
        let up = key_event_params("keyUp", '\n');
        assert_eq!(up["key"], json!("Enter"));
        assert!(up.get("text").is_none());
    }
}
