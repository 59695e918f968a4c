//! Proof target evaluation.

use serde_json::Value;

use crate::error::{KeytraceError, KeytraceResult};
use crate::fetchers::ProofDocument;
use crate::providers::ProofTarget;

/// Values found at `path`, fanning out over arrays.
///
/// Arrays met along the way apply the remaining path to each element, so
/// `["attachment", "value"]` reads `value` from every attachment. Strings,
/// numbers and booleans at the leaves are returned as text.
pub fn select_values(doc: &Value, path: &[String]) -> Vec<String> {
    let mut current = vec![doc];
    for key in path {
        current = current
            .into_iter()
            .flat_map(|value| descend(value, key))
            .collect();
    }

    let mut out = Vec::new();
    for value in current {
        collect_leaves(value, &mut out);
    }
    out
}

fn descend<'a>(value: &'a Value, key: &str) -> Vec<&'a Value> {
    match value {
        Value::Object(map) => map.get(key).into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(|item| descend(item, key)).collect(),
        _ => Vec::new(),
    }
}

fn collect_leaves(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => items.iter().for_each(|item| collect_leaves(item, out)),
        Value::Object(_) | Value::Null => {}
    }
}

/// Check that some target holds against one of `expected`.
///
/// Returns the dotted path of the first target that matched.
pub fn check_targets(
    doc: &ProofDocument,
    targets: &[ProofTarget],
    expected: &[&str],
) -> KeytraceResult<String> {
    for target in targets {
        let values = match doc {
            ProofDocument::Json(value) => select_values(value, &target.path),
            ProofDocument::Text(text) => vec![text.clone()],
        };

        let hit = values.iter().any(|found| {
            expected
                .iter()
                .any(|want| !want.is_empty() && target.relation.holds(found, want))
        });
        if hit {
            return Ok(target.path.join("."));
        }
    }

    let paths: Vec<String> = targets.iter().map(|t| t.path.join(".")).collect();
    Err(KeytraceError::AssertionMismatch {
        selector: paths.join(", "),
        reason: "proof not found in any target".to_string(),
    })
}
