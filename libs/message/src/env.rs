//! `{{.NAME}}` placeholders inside message content.
//!
//! The cloud may ship content that refers to variables of the edge host, for
//! example `{"image": "{{.REGISTRY}}/web:1"}`. Placeholders are resolved in
//! string values only; one that cannot be resolved is left as written.

use serde_json::Value;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Resolve placeholders in every string of `value`. Returns how many were
/// replaced.
pub(crate) fn expand_value<F>(value: &mut Value, lookup: &F) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(text) => match expand_str(text, lookup) {
            Some((expanded, count)) => {
                *text = expanded;
                count
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(|item| expand_value(item, lookup)).sum(),
        Value::Object(map) => map.values_mut().map(|item| expand_value(item, lookup)).sum(),
        _ => 0,
    }
}

fn expand_str<F>(text: &str, lookup: &F) -> Option<(String, usize)>
where
    F: Fn(&str) -> Option<String>,
{
    if !text.contains(OPEN) {
        return None;
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut count = 0;

    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        let whole = &rest[start..start + OPEN.len() + end + CLOSE.len()];
        let resolved = after[..end]
            .trim()
            .strip_prefix('.')
            .filter(|name| is_name(name))
            .and_then(lookup);

        out.push_str(&rest[..start]);
        match resolved {
            Some(replacement) => {
                out.push_str(&replacement);
                count += 1;
            }
            None => out.push_str(whole),
        }
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);

    (count > 0).then_some((out, count))
}

fn is_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
