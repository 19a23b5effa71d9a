//! LLM entity/relation extractor client.
//!
//! Sends a chunk's title and content to an LLM with instructions to emit
//! strict JSON `{entities, relations}`. Parsing is strict-first with a
//! bounded recovery policy for the common ways LLMs mangle JSON, and
//! failures are categorised so retry tooling and status dashboards can key
//! off a stable string (see [`ExtractorErrorCategory`]).

use std::time::Duration;

use serde::Deserialize;

use crate::config::AiConfig;
use crate::error::{ConduitError, ExtractorErrorCategory, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.7
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedRelation {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExtractionResult {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

const SYSTEM_PROMPT: &str = "You extract entities and relations from text. \
Respond with strict JSON only, no commentary, no markdown fences, matching exactly: \
{\"entities\":[{\"name\":string,\"type\":\"concept\"|\"person\"|\"org\"|\"tech\"|\"location\"|\"other\",\"description\":string,\"confidence\":number}],\
\"relations\":[{\"subject\":string,\"predicate\":string,\"object\":string,\"confidence\":number}]}";

#[derive(Clone)]
pub struct Extractor {
    provider: String,
    model: String,
    endpoint: String,
    timeout_secs: u64,
}

impl Extractor {
    pub fn new(ai: &AiConfig) -> Result<Self> {
        let provider = ai.provider.clone();
        if provider == "disabled" {
            return Err(ConduitError::Other(anyhow::anyhow!(
                "extractor requested but ai.provider is disabled"
            )));
        }
        let model = ai
            .model
            .clone()
            .ok_or_else(|| ConduitError::Other(anyhow::anyhow!("ai.model required for extraction")))?;
        let endpoint = ai.endpoint.clone().unwrap_or_else(|| default_endpoint(&provider));

        Ok(Self {
            provider,
            model,
            endpoint,
            timeout_secs: ai.timeout_seconds,
        })
    }

    /// Startup availability probe.
    pub async fn probe_availability(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ConduitError::Other(e.into()))?;

        let probe_url = match self.provider.as_str() {
            "ollama" => format!("{}/api/tags", self.endpoint),
            _ => self.endpoint.clone(),
        };

        client
            .get(&probe_url)
            .send()
            .await
            .map_err(|e| extractor_err(ExtractorErrorCategory::Connection, e.to_string()))?;
        Ok(())
    }

    /// Trivial request to force the model to load before real traffic arrives.
    pub async fn warmup(&self) -> Result<()> {
        self.extract("warmup", "The quick brown fox jumps over the lazy dog.")
            .await
            .map(|_| ())
    }

    pub async fn extract(&self, title: &str, content: &str) -> Result<ExtractionResult> {
        let raw = self.call_model(title, content).await?;
        parse_extraction_response(&raw)
    }

    async fn call_model(&self, title: &str, content: &str) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ConduitError::Other(e.into()))?;

        let user_prompt = format!("Title: {title}\n\nContent:\n{content}");

        let (url, body) = match self.provider.as_str() {
            "ollama" => (
                format!("{}/api/chat", self.endpoint),
                serde_json::json!({
                    "model": self.model,
                    "stream": false,
                    "messages": [
                        {"role": "system", "content": SYSTEM_PROMPT},
                        {"role": "user", "content": user_prompt},
                    ],
                }),
            ),
            _ => (
                self.endpoint.clone(),
                serde_json::json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": SYSTEM_PROMPT},
                        {"role": "user", "content": user_prompt},
                    ],
                }),
            ),
        };

        let mut request = client.post(&url).json(&body);
        if self.provider == "openai" {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                extractor_err(ExtractorErrorCategory::Timeout, e.to_string())
            } else {
                extractor_err(ExtractorErrorCategory::Connection, e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(extractor_err(
                ExtractorErrorCategory::Connection,
                format!("model endpoint returned {status}: {text}"),
            ));
        }

        let envelope: serde_json::Value = response
            .json()
            .await
            .map_err(|e| extractor_err(ExtractorErrorCategory::ParseError, e.to_string()))?;

        extract_message_text(&envelope)
    }
}

fn default_endpoint(provider: &str) -> String {
    match provider {
        "ollama" => "http://localhost:11434".to_string(),
        "openai" => "https://api.openai.com/v1/chat/completions".to_string(),
        _ => "http://localhost:11434".to_string(),
    }
}

fn extractor_err(category: ExtractorErrorCategory, message: String) -> ConduitError {
    ConduitError::Extractor { category, message }
}

/// Pull the model's raw text reply out of either an OpenAI-style or
/// Ollama-style chat completion envelope.
fn extract_message_text(envelope: &serde_json::Value) -> Result<String> {
    if let Some(text) = envelope
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        return Ok(text.to_string());
    }
    if let Some(text) = envelope
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        return Ok(text.to_string());
    }
    Err(extractor_err(
        ExtractorErrorCategory::SchemaMismatch,
        "could not locate assistant message content in model response".into(),
    ))
}

/// Strict-first JSON parse with bounded recovery, per the categorised
/// failure policy: fenced-code extraction, bracket-balanced substring
/// extraction, and quirk normalisation before giving up.
fn parse_extraction_response(raw: &str) -> Result<ExtractionResult> {
    if let Ok(result) = serde_json::from_str::<ExtractionResult>(raw.trim()) {
        return Ok(result);
    }

    let candidate = extract_fenced_code(raw).unwrap_or_else(|| raw.to_string());
    if let Ok(result) = serde_json::from_str::<ExtractionResult>(candidate.trim()) {
        return Ok(result);
    }

    let bracketed = extract_bracket_balanced(&candidate).unwrap_or(candidate);
    if let Ok(result) = serde_json::from_str::<ExtractionResult>(bracketed.trim()) {
        return Ok(result);
    }

    let normalized = normalize_quirks(&bracketed);
    match serde_json::from_str::<ExtractionResult>(normalized.trim()) {
        Ok(result) => Ok(result),
        Err(e) => {
            let category = classify_parse_failure(&normalized, &e);
            Err(extractor_err(category, e.to_string()))
        }
    }
}

fn extract_fenced_code(raw: &str) -> Option<String> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let end = after_fence.find("```")?;
    Some(after_fence[..end].to_string())
}

fn extract_bracket_balanced(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    // Unbalanced at end-of-string: close remaining braces if nothing else is broken.
    if depth > 0 {
        let mut s = raw[start..].to_string();
        for _ in 0..depth {
            s.push('}');
        }
        return Some(s);
    }
    None
}

/// Unescape stray `\_` (a common LLM tic) and strip trailing commas before
/// closing braces/brackets.
fn normalize_quirks(raw: &str) -> String {
    let unescaped = raw.replace("\\_", "_");
    let mut out = String::with_capacity(unescaped.len());
    let mut chars = unescaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            let mut lookahead = chars.clone();
            while let Some(&next) = lookahead.peek() {
                if next.is_whitespace() {
                    lookahead.next();
                } else {
                    break;
                }
            }
            if matches!(lookahead.peek(), Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn classify_parse_failure(raw: &str, _err: &serde_json::Error) -> ExtractorErrorCategory {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ExtractorErrorCategory::IncompleteJson;
    }
    let opens = trimmed.matches('{').count();
    let closes = trimmed.matches('}').count();
    if opens != closes {
        return ExtractorErrorCategory::IncompleteJson;
    }
    if trimmed.contains("\\_") {
        return ExtractorErrorCategory::InvalidEscape;
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return ExtractorErrorCategory::SchemaMismatch;
    }
    ExtractorErrorCategory::ParseError
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strict_json() {
        let raw = r#"{"entities":[{"name":"OAuth2","type":"tech"}],"relations":[]}"#;
        let result = parse_extraction_response(raw).unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].name, "OAuth2");
    }

    #[test]
    fn recovers_fenced_code_block() {
        let raw = "Here you go:\n```json\n{\"entities\":[],\"relations\":[]}\n```\nThanks.";
        let result = parse_extraction_response(raw).unwrap();
        assert!(result.entities.is_empty());
    }

    #[test]
    fn recovers_trailing_comma() {
        let raw = r#"{"entities":[{"name":"X","type":"concept"},],"relations":[]}"#;
        let result = parse_extraction_response(raw).unwrap();
        assert_eq!(result.entities.len(), 1);
    }

    #[test]
    fn recovers_unclosed_brace() {
        let raw = r#"{"entities":[],"relations":[]"#;
        let result = parse_extraction_response(raw).unwrap();
        assert!(result.entities.is_empty());
    }

    #[test]
    fn recovers_stray_escaped_underscore() {
        let raw = r#"{"entities":[{"name":"threat\_model","type":"concept"}],"relations":[]}"#;
        let result = parse_extraction_response(raw).unwrap();
        assert_eq!(result.entities[0].name, "threat_model");
    }

    #[test]
    fn persistent_garbage_is_categorised_error() {
        let err = parse_extraction_response("not json at all").unwrap_err();
        match err {
            ConduitError::Extractor { category, .. } => {
                assert_eq!(category, ExtractorErrorCategory::ParseError);
            }
            _ => panic!("expected Extractor error"),
        }
    }
}
