//! Strict parsing of model output with a documented fallback.
//!
//! Models wrap JSON in code fences, prefix it with prose, or trail it with
//! commentary. [`parse_structured`] unwraps all of that and deserializes the
//! first balanced object; [`parse_or_default`] turns any failure into the
//! type's default so a malformed reply never escapes the stage that asked.

use serde::de::DeserializeOwned;
use tracing::warn;

use intentflow_shared::{IntentflowError, Result};

/// Remove a surrounding Markdown code fence (with or without a language tag).
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// The first syntactically balanced `{...}` in `text`.
///
/// Braces inside JSON strings (including escaped quotes) are ignored.
pub fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Unwrap and deserialize a model reply.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let unfenced = strip_fences(raw);
    let object = extract_object(unfenced)
        .ok_or_else(|| IntentflowError::parse("no JSON object in model reply"))?;
    serde_json::from_str(object)
        .map_err(|e| IntentflowError::parse(format!("malformed model reply: {e}")))
}

/// [`parse_structured`], falling back to `T::default()` on any failure.
pub fn parse_or_default<T: DeserializeOwned + Default>(raw: &str) -> T {
    match parse_structured(raw) {
        Ok(value) => value,
        Err(e) => {
            let preview: String = raw.chars().take(120).collect();
            warn!(error = %e, preview = %preview, "using default for unparseable model reply");
            T::default()
        }
    }
}
