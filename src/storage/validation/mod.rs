// Key and content checks shared by every storage strategy


use fancy_regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::model::MAX_NAME_LENGTH;
use crate::{Result, StoreError};

/// Largest serialized entity body accepted by any strategy
pub const MAX_ENTITY_BYTES: usize = 4 * 1024 * 1024;

/// Deepest JSON nesting accepted in an entity body
pub const MAX_JSON_DEPTH: usize = 64;

static SCRIPT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*/?\s*script\b|javascript\s*:|<\s*iframe\b").expect("valid regex")
});

/// Model keys become directory names, blob prefixes and partition prefixes
#[inline]
pub fn validate_model_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(StoreError::validation(
            "validate location",
            key,
            "model location cannot be empty",
        ));
    }

    if key.chars().count() > MAX_NAME_LENGTH {
        return Err(StoreError::validation(
            "validate location",
            key,
            format!("model location exceeds {} characters", MAX_NAME_LENGTH),
        ));
    }

    if key.contains("..") || key.starts_with('.') {
        return Err(StoreError::validation(
            "validate location",
            key,
            "model location cannot contain traversal sequences",
        ));
    }

    if let Some(bad) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(StoreError::validation(
            "validate location",
            key,
            format!("model location contains unsupported character {:?}", bad),
        ));
    }

    Ok(())
}

/// Size, depth and script checks applied to a serialized entity before it is written
#[inline]
pub fn check_serialized(target: &str, text: &str, value: &Value) -> Result<()> {
    if text.len() > MAX_ENTITY_BYTES {
        return Err(StoreError::validation(
            "serialize entity",
            target,
            format!(
                "serialized size {} bytes exceeds limit of {} bytes",
                text.len(),
                MAX_ENTITY_BYTES
            ),
        ));
    }

    let depth = json_depth(value);
    if depth > MAX_JSON_DEPTH {
        return Err(StoreError::validation(
            "serialize entity",
            target,
            format!("nesting depth {} exceeds limit of {}", depth, MAX_JSON_DEPTH),
        ));
    }

    if contains_script(value) {
        return Err(StoreError::validation(
            "serialize entity",
            target,
            "content contains embedded script",
        ));
    }

    Ok(())
}

/// Deserialization-side guard: oversized bodies are corrupt, not loadable
#[inline]
pub fn check_incoming(target: &str, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_ENTITY_BYTES {
        return Err(StoreError::corrupt(
            "deserialize entity",
            target,
            format!("body of {} bytes exceeds limit", bytes.len()),
        ));
    }
    Ok(())
}

#[inline]
pub fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn contains_script(value: &Value) -> bool {
    match value {
        Value::String(text) => SCRIPT_PATTERN.is_match(text).unwrap_or(true),
        Value::Array(items) => items.iter().any(contains_script),
        Value::Object(map) => map.values().any(contains_script),
        _ => false,
    }
}
