// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Hover content normalization.
//!
//! Servers may answer `textDocument/hover` with a plain string, a markup
//! object, a marked code block, or an array mixing these. Everything is
//! flattened into one text plus an optional language tag.

use lsp_types::Range;
use serde::Serialize;
use serde_json::Value;

/// Text returned when the server has nothing to say about a position.
pub const NO_HOVER_INFORMATION: &str = "No hover information available at this position";

/// The hover content shapes a server may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoverContent {
    /// A bare string (markdown by convention).
    Plain(String),
    /// `{ kind, value }` markup content.
    Markup {
        /// `"markdown"` or `"plaintext"`.
        kind: String,
        /// The content.
        value: String,
    },
    /// `{ language, value }` marked code.
    Code {
        /// Language tag of the snippet.
        language: String,
        /// The code itself.
        value: String,
    },
    /// An array of any of the above.
    Mixed(Vec<HoverContent>),
}

impl HoverContent {
    /// Builds content from the `contents` field of a hover response.
    ///
    /// Objects are told apart by their discriminating key: `kind` means
    /// markup, `language` means marked code. Returns `None` for `null` and
    /// for shapes that carry no text.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Plain(s.clone())),
            Value::Array(items) => Some(Self::Mixed(
                items.iter().filter_map(Self::from_value).collect(),
            )),
            Value::Object(map) => {
                let text = map.get("value").and_then(Value::as_str)?.to_string();
                if let Some(kind) = map.get("kind").and_then(Value::as_str) {
                    Some(Self::Markup {
                        kind: kind.to_string(),
                        value: text,
                    })
                } else if let Some(language) = map.get("language").and_then(Value::as_str) {
                    Some(Self::Code {
                        language: language.to_string(),
                        value: text,
                    })
                } else {
                    Some(Self::Plain(text))
                }
            }
            _ => None,
        }
    }

    /// Flattens the content into text and the first explicit language tag.
    #[must_use]
    pub fn normalize(&self) -> NormalizedHover {
        let mut segments = Vec::new();
        let mut language = None;
        self.collect(&mut segments, &mut language);

        if segments.is_empty() {
            return NormalizedHover::empty();
        }

        NormalizedHover {
            text: segments.join("\n\n"),
            language,
        }
    }

    fn collect(&self, segments: &mut Vec<String>, language: &mut Option<String>) {
        match self {
            Self::Plain(text) | Self::Markup { value: text, .. } => {
                let text = text.trim();
                if !text.is_empty() {
                    segments.push(text.to_string());
                }
            }
            Self::Code { language: lang, value } => {
                if language.is_none() && !lang.is_empty() {
                    *language = Some(lang.clone());
                }
                let value = value.trim_end();
                if !value.trim().is_empty() {
                    segments.push(format!("```{lang}\n{value}\n```"));
                }
            }
            Self::Mixed(items) => {
                for item in items {
                    item.collect(segments, language);
                }
            }
        }
    }
}

/// Hover content after flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedHover {
    /// Concatenated text of every segment.
    pub text: String,
    /// First explicit language tag, if any segment carried one.
    pub language: Option<String>,
}

impl NormalizedHover {
    /// The "nothing here" value.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            text: NO_HOVER_INFORMATION.to_string(),
            language: None,
        }
    }

    /// Returns true if this is the "nothing here" value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text == NO_HOVER_INFORMATION
    }
}

/// Normalizes an optional `contents` value; `None` and `null` give the sentinel.
#[must_use]
pub fn normalize_value(contents: Option<&Value>) -> NormalizedHover {
    contents
        .and_then(HoverContent::from_value)
        .map_or_else(NormalizedHover::empty, |content| content.normalize())
}

/// Outcome of a hover query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoverResult {
    /// False only when the query itself failed.
    pub success: bool,
    /// Hover text, or the "no information" sentinel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    /// Language of the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Range the hover applies to, as reported by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    /// Why the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HoverResult {
    /// A successful result.
    #[must_use]
    pub const fn found(contents: String, language: Option<String>, range: Option<Range>) -> Self {
        Self {
            success: true,
            contents: Some(contents),
            language,
            range,
            error: None,
        }
    }

    /// A successful result carrying the sentinel text.
    #[must_use]
    pub fn empty(language: Option<String>) -> Self {
        Self::found(NO_HOVER_INFORMATION.to_string(), language, None)
    }

    /// A failed result.
    #[must_use]
    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            contents: None,
            language: None,
            range: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for clear failure messages")]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_string() {
        let hover = normalize_value(Some(&json!("just text")));
        assert_eq!(hover.text, "just text");
        assert_eq!(hover.language, None);
    }

    #[test]
    fn test_markup_content_kept_verbatim() {
        let value = json!({ "kind": "markdown", "value": "```python\ndef f()\n```\n\nDocs." });
        let hover = normalize_value(Some(&value));
        assert_eq!(hover.text, "```python\ndef f()\n```\n\nDocs.");
        assert_eq!(hover.language, None);
    }

    #[test]
    fn test_marked_code_becomes_fenced_block() {
        let value = json!({ "language": "rust", "value": "fn main()" });
        let hover = normalize_value(Some(&value));
        assert_eq!(hover.text, "```rust\nfn main()\n```");
        assert_eq!(hover.language.as_deref(), Some("rust"));
    }

    #[test]
    fn test_mixed_array_takes_first_language() {
        let value = json!([
            { "language": "python", "value": "def add_numbers(x, y) -> int" },
            "Add two numbers together.",
            { "language": "text", "value": "ignored tag" }
        ]);
        let hover = normalize_value(Some(&value));
        assert_eq!(
            hover.text,
            "```python\ndef add_numbers(x, y) -> int\n```\n\nAdd two numbers together.\n\n```text\nignored tag\n```"
        );
        assert_eq!(hover.language.as_deref(), Some("python"));
    }

    #[test]
    fn test_null_and_missing_are_the_sentinel() {
        assert_eq!(normalize_value(Some(&Value::Null)), NormalizedHover::empty());
        assert_eq!(normalize_value(None), NormalizedHover::empty());
        assert!(normalize_value(None).is_empty());
    }

    #[test]
    fn test_empty_segments_are_the_sentinel() {
        let hover = normalize_value(Some(&json!(["", { "kind": "plaintext", "value": "  " }])));
        assert!(hover.is_empty());
    }

    #[test]
    fn test_discriminant_builds_variants() {
        assert_eq!(
            HoverContent::from_value(&json!({ "kind": "plaintext", "value": "x" })).unwrap(),
            HoverContent::Markup {
                kind: "plaintext".to_string(),
                value: "x".to_string()
            }
        );
        assert!(HoverContent::from_value(&json!(42)).is_none());
    }

    #[test]
    fn test_result_serialization_skips_absent_fields() {
        let value = serde_json::to_value(HoverResult::failure("File not found: /x")).unwrap();
        assert_eq!(value, json!({ "success": false, "error": "File not found: /x" }));

        let value = serde_json::to_value(HoverResult::empty(None)).unwrap();
        assert_eq!(
            value,
            json!({ "success": true, "contents": NO_HOVER_INFORMATION })
        );
    }
}
