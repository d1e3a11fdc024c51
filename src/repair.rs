//! Best-effort repair of malformed tool-call argument JSON produced
//! mid-stream. Applied only after a parse failure; success substitutes the
//! repaired text transparently, failure downgrades to a per-call error that
//! leaves the rest of the stream intact.

use serde_json::Value;

/// Parse `raw` as a JSON object, repairing common truncation damage:
/// an unterminated trailing string, then missing `}`, then missing `]`.
/// `None` means unrepairable; this never panics or raises.
pub fn parse_or_repair_arguments(raw: &str) -> Option<(Value, bool)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        // Providers stream zero-argument calls as empty text.
        return Some((Value::Object(serde_json::Map::new()), false));
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some((value, false));
    }

    let repaired = repair_json(trimmed);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            tracing::debug!(
                original_len = trimmed.len(),
                repaired_len = repaired.len(),
                "repaired truncated tool-call arguments"
            );
            Some((value, true))
        }
        Err(error) => {
            tracing::warn!("tool-call arguments unrepairable: {error}");
            None
        }
    }
}

fn repair_json(raw: &str) -> String {
    let mut text = raw.to_string();

    if has_unterminated_string(&text) {
        text.push('"');
    }

    // Close unbalanced containers innermost-first.
    for delimiter in open_delimiters(&text).into_iter().rev() {
        text.push(match delimiter {
            '{' => '}',
            _ => ']',
        });
    }

    text
}

/// True when the text ends inside a string value (an odd number of
/// unescaped quotes). Targets only the trailing-truncation pattern; repeated
/// mid-stream corruption is out of scope.
fn has_unterminated_string(text: &str) -> bool {
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ => {}
        }
    }
    in_string
}

/// Stack of unclosed `{` and `[` outside string values, outermost first.
fn open_delimiters(text: &str) -> Vec<char> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => stack.push(ch),
            '}' if !in_string => {
                if stack.last() == Some(&'{') {
                    stack.pop();
                }
            }
            ']' if !in_string => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    stack
}

#[cfg(test)]
mod tests {
    use super::parse_or_repair_arguments;
    use serde_json::json;

    #[test]
    fn valid_json_passes_unrepaired() {
        let (value, repaired) = parse_or_repair_arguments(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert!(!repaired);
    }

    #[test]
    fn closes_unterminated_trailing_string() {
        let (value, repaired) = parse_or_repair_arguments(r#"{"a": "unterminated"#).unwrap();
        assert_eq!(value, json!({"a": "unterminated"}));
        assert!(repaired);
    }

    #[test]
    fn appends_missing_brackets_then_braces() {
        let (value, repaired) = parse_or_repair_arguments(r#"{"a": [1,2"#).unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
        assert!(repaired);
    }

    #[test]
    fn nested_truncation() {
        let (value, _) =
            parse_or_repair_arguments(r#"{"cmd": "ls", "opts": {"depth": [1, {"x": "y"#).unwrap();
        assert_eq!(value, json!({"cmd": "ls", "opts": {"depth": [1, {"x": "y"}]}}));
    }

    #[test]
    fn unrepairable_returns_none_without_panicking() {
        assert!(parse_or_repair_arguments("{not json at all").is_none());
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let (value, repaired) = parse_or_repair_arguments("  ").unwrap();
        assert_eq!(value, json!({}));
        assert!(!repaired);
    }

    #[test]
    fn escaped_quotes_do_not_confuse_string_tracking() {
        let (value, _) = parse_or_repair_arguments(r#"{"a": "he said \"hi\"", "b": [true"#).unwrap();
        assert_eq!(value, json!({"a": "he said \"hi\"", "b": [true]}));
    }
}
