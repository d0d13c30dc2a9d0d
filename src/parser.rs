//! Tolerant decoding of structured payloads out of LLM text
//!
//! Models like to wrap JSON in markdown fences (```json ... ```), and the
//! profiling skill appends its JSON summary after a free-form report. Both
//! shapes are handled here so callers only see a typed value or a `ParseError`.

use crate::error::ParseError;
use serde::de::DeserializeOwned;

const ENCODING_PREVIEW_CHARS: usize = 100;
const DECODE_PREVIEW_CHARS: usize = 200;

fn preview(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect()
}

/// Remove a surrounding markdown code fence, if any
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(mut rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };

    if rest
        .get(..4)
        .is_some_and(|tag| tag.eq_ignore_ascii_case("json"))
    {
        rest = &rest[4..];
    }
    let rest = rest.trim_start();
    let rest = rest.strip_suffix("```").unwrap_or(rest);

    rest.trim().to_string()
}

/// Decode raw bytes; fails with `EncodingError` if the cleaned text is not UTF-8
pub fn parse_bytes<T: DeserializeOwned>(raw: &[u8]) -> Result<T, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::EncodingError {
        preview: preview(&String::from_utf8_lossy(raw), ENCODING_PREVIEW_CHARS),
    })?;
    parse(text)
}

/// Strip any code fence and decode the rest as `T`
pub fn parse<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    let cleaned = strip_code_fence(raw);
    serde_json::from_slice(cleaned.as_bytes()).map_err(|source| ParseError::DecodeError {
        preview: preview(raw, DECODE_PREVIEW_CHARS),
        source,
    })
}

/// Find the last JSON object in `text` that decodes as `T`
///
/// Used for the profiling report, where the structured summary trails the
/// narrative. Text after the object (a closing fence, a sign-off) is ignored.
pub fn extract_trailing_json<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let first_err = match parse::<T>(text) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    for (idx, _) in text.rmatch_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<T>();
        if let Some(Ok(value)) = stream.next() {
            return Ok(value);
        }
    }

    Err(first_err)
}
