use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r"(?i)(sk-[A-Za-z0-9_-]{20,}|Bearer\s+[^\s]+|x-api-key:\s*[^\s]+)"
    ).expect("Invalid redaction regex");
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    /// Secrets plus every piece of conversation content.
    Strict,
    #[default]
    Normal,
}

impl RedactionLevel {
    pub fn from_env() -> Self {
        match std::env::var("DUET_REDACTION_LEVEL")
            .unwrap_or_else(|_| "normal".to_string())
            .to_lowercase()
            .as_str()
        {
            "strict" => RedactionLevel::Strict,
            _ => RedactionLevel::Normal,
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let k = key.to_lowercase();
    k.contains("token")
        || k.contains("secret")
        || k.contains("password")
        || k.contains("apikey")
        || k.contains("api_key")
        || k == "authorization"
        || k == "cookie"
}

fn is_content_key(key: &str) -> bool {
    matches!(key, "text" | "think" | "args" | "output" | "content")
}

pub fn redact_value(v: &mut Value, level: RedactionLevel) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                if is_secret_key(k) {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }
                if level == RedactionLevel::Strict && is_content_key(k) && !val.is_array() {
                    *val = Value::String("[REDACTED-STRICT]".to_string());
                    continue;
                }
                redact_value(val, level);
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val, level);
            }
        }
        _ => {}
    }
}

pub fn redact_text(input: &str) -> std::borrow::Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

/// Writer wrapper that masks bearer tokens and API keys in formatted log lines.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact_text(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secrets_are_masked_at_every_level() {
        let mut v = json!({"token": "abc", "nested": [{"Authorization": "Bearer x"}], "text": "hi"});
        redact_value(&mut v, RedactionLevel::Normal);
        assert_eq!(v["token"], "[REDACTED]");
        assert_eq!(v["nested"][0]["Authorization"], "[REDACTED]");
        assert_eq!(v["text"], "hi");
    }

    #[test]
    fn strict_masks_content_but_keeps_structure() {
        let mut v = json!({"content": [{"type": "text", "text": "secret plan"}], "messageId": "m1"});
        redact_value(&mut v, RedactionLevel::Strict);
        assert_eq!(v["content"][0]["text"], "[REDACTED-STRICT]");
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["messageId"], "m1");
    }

    #[test]
    fn writer_masks_bearer_tokens() {
        let mut out = Vec::new();
        {
            let mut w = RedactingWriter::new(&mut out);
            let _ = w.write(b"auth=Bearer abc.def.ghi done");
        }
        assert_eq!(String::from_utf8_lossy(&out), "auth=[REDACTED] done");
    }
}
