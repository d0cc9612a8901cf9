use super::{Provider, TokenStream, prompt};
use crate::config::ProviderConfig;
use crate::review::extractor::{json_object_slice, summary_from_value};
use crate::types::{ChangeSet, ReviewConfig, Summary};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

const DONE_MARKER: &str = "[DONE]";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed server-sent line of a streaming chat completion
#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Parse a single SSE line; only `data:` lines carry content
fn parse_sse_line(line: &str) -> anyhow::Result<SseLine> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == DONE_MARKER {
        return Ok(SseLine::Done);
    }

    let value: Value = serde_json::from_str(data).context("Malformed stream event")?;
    if let Some(error) = value.get("error") {
        return Err(anyhow!("Stream error: {}", error));
    }
    let delta = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if delta.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Delta(delta.to_string()))
    }
}

/// Drain every complete line from `buffer`, collecting deltas. Returns `true` on `[DONE]`.
fn drain_lines(buffer: &mut Vec<u8>, deltas: &mut Vec<String>) -> anyhow::Result<bool> {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = std::str::from_utf8(&line[..pos]).context("Invalid UTF-8 in stream")?;
        match parse_sse_line(line)? {
            SseLine::Delta(delta) => deltas.push(delta),
            SseLine::Done => return Ok(true),
            SseLine::Skip => {}
        }
    }
    Ok(false)
}

/// OpenAI-compatible chat-completions backend
pub struct OpenAIProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// Request body with configured extras merged over the defaults; `stream` always wins
    fn request_body(&self, system: &str, user: &str, stream: bool) -> Value {
        let messages = [
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ];
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
        });
        if let Some(target) = body.as_object_mut() {
            if let Some(extra) = self.config.body.as_object() {
                for (key, value) in extra {
                    target.insert(key.clone(), value.clone());
                }
            }
            target.insert("stream".to_string(), Value::Bool(stream));
        }
        body
    }

    async fn send(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let api_key = self
            .api_key()
            .with_context(|| format!("{} is not set", self.config.api_key_env))?;

        let mut request = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(api_key)
            .json(body);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.context("Failed to send request")?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("API error: {} - {}", status, error_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn is_ready(&self, _config: &ReviewConfig) -> bool {
        !self.config.base_url.is_empty() && !self.config.model.is_empty() && self.api_key().is_some()
    }

    async fn stream_review(
        &self,
        change_set: &ChangeSet,
        config: &ReviewConfig,
        summary: Option<&Summary>,
    ) -> anyhow::Result<TokenStream> {
        let (system, user) = prompt::review_messages(change_set, config, summary);
        trace!(
            "[Provider {}] Review prompt is {} characters",
            self.config.id,
            user.len()
        );
        let response = self.send(&self.request_body(&system, &user, true)).await?;
        debug!("[Provider {}] Stream opened", self.config.id);

        // (bytes, undecoded tail, decoded deltas awaiting delivery, finished)
        let state = (response.bytes_stream().boxed(), Vec::new(), Vec::new(), false);
        let stream = futures::stream::unfold(
            state,
            |(mut bytes, mut buffer, mut deltas, mut done): (_, Vec<u8>, Vec<String>, bool)| async move {
                loop {
                    if !deltas.is_empty() {
                        let delta = deltas.remove(0);
                        return Some((Ok(delta), (bytes, buffer, deltas, done)));
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                            match drain_lines(&mut buffer, &mut deltas) {
                                Ok(finished) => done = finished,
                                Err(e) => {
                                    done = true;
                                    deltas.clear();
                                    return Some((Err(e), (bytes, buffer, deltas, done)));
                                }
                            }
                        }
                        Some(Err(e)) => {
                            done = true;
                            let error = anyhow::Error::from(e).context("Failed to read chunk");
                            return Some((Err(error), (bytes, buffer, deltas, done)));
                        }
                        None => {
                            done = true;
                            buffer.push(b'\n');
                            if let Err(e) = drain_lines(&mut buffer, &mut deltas) {
                                return Some((Err(e), (bytes, buffer, deltas, done)));
                            }
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn generate_summary(
        &self,
        change_set: &ChangeSet,
        _config: &ReviewConfig,
    ) -> anyhow::Result<Option<Summary>> {
        let (system, user) = prompt::summary_messages(change_set);
        let response = self.send(&self.request_body(&system, &user, false)).await?;
        let chat: ChatResponse = response.json().await.context("Malformed summary response")?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        let summary = json_object_slice(&content)
            .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
            .and_then(|value| summary_from_value(&value))
            .or_else(|| summary_from_value(&Value::String(content.clone())));
        debug!(
            "[Provider {}] Generated summary: {}",
            self.config.id,
            summary.is_some()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(api_key_env: &str) -> OpenAIProvider {
        OpenAIProvider::new(ProviderConfig {
            id: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: api_key_env.into(),
            headers: Default::default(),
            body: serde_json::json!({"temperature": 0.1, "stream": false}),
        })
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"{\"sug"}}]}"#).unwrap(),
            SseLine::Delta("{\"sug".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert!(parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#).is_err());
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn test_drain_lines_keeps_partial_tail() {
        let mut buffer = b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r\n\r\ndata: {\"cho".to_vec();
        let mut deltas = Vec::new();
        assert!(!drain_lines(&mut buffer, &mut deltas).unwrap());
        assert_eq!(deltas, vec!["a".to_string()]);
        assert_eq!(buffer, b"data: {\"cho".to_vec());

        buffer.extend_from_slice(b"ices\":[{\"delta\":{\"content\":\"b\"}}]}\n\ndata: [DONE]\n");
        assert!(drain_lines(&mut buffer, &mut deltas).unwrap());
        assert_eq!(deltas, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_request_body_merges_extras() {
        let body = provider("CONCORD_TEST_UNSET_KEY").request_body("sys", "usr", true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "usr");
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_not_ready_without_api_key() {
        let provider = provider("CONCORD_TEST_DEFINITELY_UNSET_KEY");
        assert!(!provider.is_ready(&ReviewConfig::default()));
    }
}
