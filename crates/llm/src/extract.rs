//! Extraction of the JSON object a model was asked to answer with.
//!
//! Models wrap JSON in prose or Markdown fences often enough that a strict
//! `serde_json::from_str` on the whole reply is not enough. The extractor
//! tries, in order: the whole reply, the first fenced block, and the first
//! balanced `{...}` span.

use serde_json::Value;

/// Returns the first JSON object found in `text`, or `None`.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Some(value) = parse_object(trimmed) {
        return Some(value);
    }
    if let Some(value) = fenced_block(trimmed).and_then(parse_object) {
        return Some(value);
    }
    balanced_object(trimmed).and_then(parse_object)
}

fn parse_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(Value::is_object)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an info string such as `json`.
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_object_plain_reply_expected_object() {
        assert_eq!(
            extract_json_object(r#" {"approved": true} "#),
            Some(json!({"approved": true}))
        );
    }

    #[test]
    fn extract_json_object_fenced_reply_expected_object() {
        let reply = "Here is the review:\n```json\n{\"approved\": false, \"comments\": [\"add tests\"]}\n```\nThanks.";
        assert_eq!(
            extract_json_object(reply),
            Some(json!({"approved": false, "comments": ["add tests"]}))
        );
    }

    #[test]
    fn extract_json_object_prose_with_braces_in_strings_expected_balanced_span() {
        let reply = r#"My answer: {"summary": "use {braces} carefully", "n": 1} as requested"#;
        assert_eq!(
            extract_json_object(reply),
            Some(json!({"summary": "use {braces} carefully", "n": 1}))
        );
    }

    #[test]
    fn extract_json_object_array_or_nothing_expected_none() {
        assert_eq!(extract_json_object("[1, 2]"), None);
        assert_eq!(extract_json_object("no json here"), None);
    }
}
