//! JSON path selectors: `$`, `.name`, `['name']` and `[index]`.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::KeytraceError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed selector such as `$.files['proof.md'].content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    raw: String,
    segments: Vec<Segment>,
}

impl Selector {
    /// The value the selector points at, if any.
    pub fn select<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(doc, |value, segment| match segment {
                Segment::Key(key) => value.get(key.as_str()),
                Segment::Index(i) => value.get(*i),
            })
    }
}

impl FromStr for Selector {
    type Err = KeytraceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid =
            |why: &str| KeytraceError::malformed(format!("invalid selector {raw:?}: {why}"));

        let rest = raw.strip_prefix('$').ok_or_else(|| invalid("must start with $"))?;
        let bytes = rest.as_bytes();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'.' => {
                    let start = i + 1;
                    let end = rest[start..]
                        .find(['.', '['])
                        .map_or(rest.len(), |off| start + off);
                    if end == start {
                        return Err(invalid("empty field name"));
                    }
                    segments.push(Segment::Key(rest[start..end].to_string()));
                    i = end;
                }
                b'[' => {
                    let close = rest[i..]
                        .find(']')
                        .map(|off| i + off)
                        .ok_or_else(|| invalid("unclosed bracket"))?;
                    let inner = &rest[i + 1..close];
                    let segment = if let Some(quoted) = inner
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                    {
                        Segment::Key(quoted.to_string())
                    } else {
                        inner
                            .parse::<usize>()
                            .map(Segment::Index)
                            .map_err(|_| invalid("bracket must hold a quoted name or an index"))?
                    };
                    segments.push(segment);
                    i = close + 1;
                }
                _ => return Err(invalid("expected . or [")),
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sel(s: &str) -> Selector {
        s.parse().unwrap()
    }

    #[test]
    fn test_root() {
        let doc = json!({ "a": 1 });
        assert_eq!(sel("$").select(&doc), Some(&doc));
    }

    #[test]
    fn test_dotted_and_bracketed() {
        let doc = json!({
            "keytrace": "3kabc",
            "files": { "proof.md": { "content": "hi" } },
            "list": [ { "v": "first" }, { "v": "second" } ]
        });
        assert_eq!(sel("$.keytrace").select(&doc), Some(&json!("3kabc")));
        assert_eq!(sel("$.files['proof.md'].content").select(&doc), Some(&json!("hi")));
        assert_eq!(sel("$[\"files\"]['proof.md']").select(&doc), Some(&json!({ "content": "hi" })));
        assert_eq!(sel("$.list[1].v").select(&doc), Some(&json!("second")));
        assert_eq!(sel("$.list[5].v").select(&doc), None);
        assert_eq!(sel("$.missing").select(&doc), None);
    }

    #[test]
    fn test_rejects_bad_syntax() {
        for bad in ["keytrace", "$..a", "$.a[", "$[x]", "$a"] {
            assert!(bad.parse::<Selector>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_display_round_trips_raw() {
        assert_eq!(sel("$.did").to_string(), "$.did");
    }
}
