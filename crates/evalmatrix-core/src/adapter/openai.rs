//! OpenAI-compatible chat completions adapter.
//!
//! The only provider-specific code in the engine. It maps an item input to
//! a `messages` array, issues one POST, and classifies the response into
//! the adapter error classes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use super::{AdapterError, ModelAdapter};
use crate::domain::{DatasetItem, EngineError, ModelSpec, Result};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_CREDENTIAL_ENV: &str = "OPENAI_API_KEY";
const USER_AGENT: &str = concat!("evalmatrix/", env!("CARGO_PKG_VERSION"));

/// Request parameters copied from model metadata when present.
const PASSTHROUGH_PARAMS: [&str; 4] = ["temperature", "max_tokens", "top_p", "seed"];

/// Calls one model behind an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    http_client: reqwest::Client,
    endpoint: String,
    model_name: String,
    api_key: String,
    params: serde_json::Map<String, Value>,
}

impl OpenAiAdapter {
    /// Build from a spec. The credential is read from the environment
    /// variable named by `invocation.credential_env` (default `OPENAI_API_KEY`).
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        let env_name = spec
            .invocation
            .credential_env
            .as_deref()
            .unwrap_or(DEFAULT_CREDENTIAL_ENV);
        let api_key = std::env::var(env_name).map_err(|_| EngineError::AdapterInit {
            model_id: spec.id.clone(),
            reason: format!("{env_name} is not set"),
        })?;

        let endpoint = spec
            .invocation
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let mut adapter = Self::new(&endpoint, &spec.model_name, &api_key).map_err(|e| {
            EngineError::AdapterInit {
                model_id: spec.id.clone(),
                reason: e.to_string(),
            }
        })?;
        for key in PASSTHROUGH_PARAMS {
            if let Some(value) = spec.metadata.get(key) {
                adapter.params.insert(key.to_string(), value.clone());
            }
        }
        Ok(adapter)
    }

    pub fn new(
        endpoint: &str,
        model_name: &str,
        api_key: &str,
    ) -> std::result::Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http_client,
            endpoint: endpoint.to_string(),
            model_name: model_name.to_string(),
            api_key: api_key.to_string(),
            params: serde_json::Map::new(),
        })
    }

    fn request_body(&self, item: &DatasetItem) -> std::result::Result<Value, AdapterError> {
        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(self.model_name));
        body.insert("messages".to_string(), build_messages(&item.input)?);
        for (key, value) in &self.params {
            body.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(body))
    }
}

#[async_trait]
impl ModelAdapter for OpenAiAdapter {
    async fn execute(
        &self,
        item: &DatasetItem,
        timeout: Duration,
    ) -> std::result::Result<Value, AdapterError> {
        let body = self.request_body(item)?;

        debug!(model = %self.model_name, item_id = %item.id, "chat completion request");
        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = response.text().await.map_err(classify_transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Unknown(format!("unparseable response body: {e}")))?;
        parse_completion(&parsed)
    }
}

/// Turn an item input into a chat `messages` array.
///
/// - `{"messages": [...]}` is passed through;
/// - a string becomes one user message;
/// - `{"prompt": .., "system_prompt"?: ..}` becomes system + user messages;
/// - `{"text": .., "image": url}` becomes one multimodal user message.
pub fn build_messages(input: &Value) -> std::result::Result<Value, AdapterError> {
    match input {
        Value::String(text) => Ok(json!([{"role": "user", "content": text}])),
        Value::Object(obj) => {
            if let Some(messages) = obj.get("messages") {
                return match messages {
                    Value::Array(list) if !list.is_empty() => Ok(messages.clone()),
                    _ => Err(AdapterError::InvalidInput(
                        "`messages` must be a non-empty array".to_string(),
                    )),
                };
            }
            if let Some(prompt) = obj.get("prompt").and_then(Value::as_str) {
                let mut messages = Vec::new();
                if let Some(system) = obj.get("system_prompt").and_then(Value::as_str) {
                    messages.push(json!({"role": "system", "content": system}));
                }
                messages.push(json!({"role": "user", "content": prompt}));
                return Ok(Value::Array(messages));
            }
            if let Some(image) = obj.get("image").and_then(Value::as_str) {
                let text = obj.get("text").and_then(Value::as_str).unwrap_or_default();
                return Ok(json!([{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": text},
                        {"type": "image_url", "image_url": {"url": image}}
                    ]
                }]));
            }
            Err(AdapterError::InvalidInput(
                "object input needs `messages`, `prompt` or `image`".to_string(),
            ))
        }
        other => Err(AdapterError::InvalidInput(format!(
            "unsupported input type: {}",
            json_type(other)
        ))),
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> AdapterError {
    let message = format!("{status}: {}", truncate(body, 200));
    match status.as_u16() {
        401 | 403 => AdapterError::Auth(message),
        429 => AdapterError::rate_limited(message, retry_after),
        400 | 404 | 413 | 422 => AdapterError::InvalidInput(message),
        408 | 500..=599 => AdapterError::Transient(message),
        _ => AdapterError::Unknown(message),
    }
}

fn classify_transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() {
        AdapterError::Transient(err.to_string())
    } else {
        AdapterError::Unknown(err.to_string())
    }
}

/// Parse a `Retry-After` value given in (possibly fractional) seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Extract the first choice of a chat completion body.
pub fn parse_completion(body: &Value) -> std::result::Result<Value, AdapterError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| AdapterError::Unknown("response has no choices".to_string()))?;
    let content = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Unknown("choice has no message content".to_string()))?;

    let mut output = json!({ "text": content });
    if let Some(reason) = choice.get("finish_reason").filter(|v| !v.is_null()) {
        output["finish_reason"] = reason.clone();
    }
    if let Some(usage) = body.get("usage").filter(|v| !v.is_null()) {
        output["usage"] = usage.clone();
    }
    Ok(output)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalmatrix_state::ErrorClass;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_build_messages_shapes() {
        assert_eq!(
            build_messages(&json!("hello")).unwrap(),
            json!([{"role": "user", "content": "hello"}])
        );

        let passthrough = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(
            build_messages(&passthrough).unwrap(),
            passthrough["messages"]
        );

        let mmlu = json!({"prompt": "2+2?", "system_prompt": "Answer with a letter."});
        let messages = build_messages(&mmlu).unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "2+2?");

        let vqa = json!({"text": "what is this?", "image": "https://example.com/cat.png"});
        let messages = build_messages(&vqa).unwrap();
        assert_eq!(
            messages[0]["content"][1]["image_url"]["url"],
            "https://example.com/cat.png"
        );
    }

    #[test]
    fn test_build_messages_rejects_unusable_input() {
        for input in [json!(42), json!({"foo": 1}), json!({"messages": []}), json!(null)] {
            let err = build_messages(&input).unwrap_err();
            assert_eq!(err.class(), ErrorClass::InvalidInput, "{input}");
        }
    }

    #[test]
    fn test_classify_status() {
        let hint = Some(Duration::from_secs(3));
        let cases = [
            (401, ErrorClass::Auth),
            (403, ErrorClass::Auth),
            (429, ErrorClass::RateLimited),
            (400, ErrorClass::InvalidInput),
            (413, ErrorClass::InvalidInput),
            (422, ErrorClass::InvalidInput),
            (408, ErrorClass::Transient),
            (500, ErrorClass::Transient),
            (503, ErrorClass::Transient),
            (418, ErrorClass::Unknown),
        ];
        for (code, class) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status, hint, "body").class(), class, "{code}");
        }
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, hint, "");
        assert_eq!(err.retry_after(), hint);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_parse_completion() {
        let body = json!({
            "model": "gpt-4",
            "choices": [{"message": {"role": "assistant", "content": "B"}, "finish_reason": "stop"}],
            "usage": {"total_tokens": 12}
        });
        let out = parse_completion(&body).unwrap();
        assert_eq!(out["text"], "B");
        assert_eq!(out["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 12);

        let err = parse_completion(&json!({"choices": []})).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unknown);
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/v1/chat/completions")
    }

    #[tokio::test]
    async fn test_execute_maps_429_with_retry_after() {
        let endpoint = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 2\r\nContent-Length: 4\r\nConnection: close\r\n\r\nslow",
        )
        .await;
        let adapter = OpenAiAdapter::new(&endpoint, "gpt-4", "sk-test").unwrap();
        let item = DatasetItem::new("1", json!("hi"));

        let err = adapter
            .execute(&item, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_execute_returns_completion_text() {
        let endpoint = serve_once(concat!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 57\r\nConnection: close\r\n\r\n",
            r#"{"choices":[{"message":{"content":"Paris"},"index":0}]}  "#
        ))
        .await;
        let adapter = OpenAiAdapter::new(&endpoint, "gpt-4", "sk-test").unwrap();
        let item = DatasetItem::new("1", json!({"prompt": "capital of France?"}));

        let out = adapter.execute(&item, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out["text"], "Paris");
    }

    #[tokio::test]
    async fn test_invalid_input_never_reaches_network() {
        let adapter = OpenAiAdapter::new("http://127.0.0.1:9/unused", "gpt-4", "sk").unwrap();
        let item = DatasetItem::new("1", json!(3.5));
        let err = adapter
            .execute(&item, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidInput);
    }
}
