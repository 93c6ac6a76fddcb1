//! Artifact rewriter: placeholder substitution in lab definitions.
//!
//! A lab artifact is a structured JSON document describing nodes and smart
//! annotations. At assignment time the symbolic port names of the
//! definition's port template are resolved into concrete integers, and the
//! `${PORT_<NAME>}` placeholders inside node tags and annotation
//! tags/labels are replaced with those integers. Nothing else in the
//! document is touched, and a document without placeholders passes through
//! unchanged, which makes the rewrite idempotent.

use std::collections::BTreeMap;

use serde_json::Value;

/// Placeholder string for a symbolic port name (`serial_1` →
/// `${PORT_SERIAL_1}`).
pub fn placeholder_for(name: &str) -> String {
    format!("${{PORT_{}}}", name.to_uppercase())
}

/// Substitute allocated ports into `artifact`.
///
/// `ports` maps symbolic port names to the integers the allocator leased.
/// Substitution touches only the identified fields: every string in a
/// node's `tags` array and every string in an annotation's `tags` array or
/// `labels` array.
pub fn rewrite(artifact: &Value, ports: &BTreeMap<String, u16>) -> Value {
    if ports.is_empty() {
        return artifact.clone();
    }
    let substitutions: Vec<(String, String)> = ports
        .iter()
        .map(|(name, port)| (placeholder_for(name), port.to_string()))
        .collect();

    let mut out = artifact.clone();
    if let Some(nodes) = out.get_mut("nodes").and_then(Value::as_array_mut) {
        for node in nodes {
            rewrite_string_array(node, "tags", &substitutions);
        }
    }
    if let Some(annotations) = out.get_mut("annotations").and_then(Value::as_array_mut) {
        for annotation in annotations {
            rewrite_string_array(annotation, "tags", &substitutions);
            rewrite_string_array(annotation, "labels", &substitutions);
        }
    }
    out
}

fn rewrite_string_array(parent: &mut Value, field: &str, substitutions: &[(String, String)]) {
    let Some(items) = parent.get_mut(field).and_then(Value::as_array_mut) else {
        return;
    };
    for item in items {
        if let Value::String(s) = item {
            for (placeholder, port) in substitutions {
                if s.contains(placeholder.as_str()) {
                    *s = s.replace(placeholder.as_str(), port);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact() -> Value {
        json!({
            "title": "routing-basics",
            "nodes": [
                {"id": "n0", "label": "r1", "tags": ["serial:${PORT_SERIAL_1}", "core"]},
                {"id": "n1", "label": "r2", "tags": []},
            ],
            "annotations": [
                {"type": "text", "tags": ["vnc:${PORT_VNC_1}"], "labels": ["console ${PORT_SERIAL_1}"]},
            ],
            "links": [{"n1": "n0", "n2": "n1"}],
        })
    }

    fn ports() -> BTreeMap<String, u16> {
        BTreeMap::from([("serial_1".to_string(), 5041), ("vnc_1".to_string(), 5044)])
    }

    #[test]
    fn substitutes_in_node_tags_and_annotations() {
        let out = rewrite(&artifact(), &ports());
        assert_eq!(out["nodes"][0]["tags"][0], "serial:5041");
        assert_eq!(out["annotations"][0]["tags"][0], "vnc:5044");
        assert_eq!(out["annotations"][0]["labels"][0], "console 5041");
    }

    #[test]
    fn untouched_fields_survive_byte_for_byte() {
        let input = artifact();
        let out = rewrite(&input, &ports());
        assert_eq!(out["title"], input["title"]);
        assert_eq!(out["links"], input["links"]);
        assert_eq!(out["nodes"][0]["tags"][1], "core");
        assert_eq!(out["nodes"][1], input["nodes"][1]);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite(&artifact(), &ports());
        let twice = rewrite(&once, &ports());
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_port_map_is_identity() {
        let input = artifact();
        assert_eq!(rewrite(&input, &BTreeMap::new()), input);
    }
}
