//! Completion client for the OpenAI-compatible LLM endpoint.
//!
//! The interesting part is the retry machinery: a pure [`RetryPolicy`]
//! drives any [`CompletionBackend`] through `max_retries` attempts against
//! the default model (exponential backoff between attempts), an optional
//! JSON-validation predicate that turns malformed bodies into retries, and
//! a one-attempt-each walk of the fallback model list.  The policy is
//! exercised in tests against a scripted backend; the HTTP transport is a
//! thin [`HttpCompletionBackend`] underneath.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use engram_config::LiteLlmConfig;

// ── Request / response types ─────────────────────────────────────────────────

/// A single completion request.  Model selection is not part of the
/// request: the client always starts from its configured default model
/// and walks the fallback chain.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// When set, a response body that does not contain a JSON object counts
    /// as a failed attempt and is retried.
    pub require_json: bool,
}

impl CompletionRequest {
    /// Defaults used by the note-construction path.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.1,
            max_tokens: 1000,
            require_json: false,
        }
    }

    pub fn with_json(mut self) -> Self {
        self.require_json = true;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

/// Anything that can answer a completion request.  The memory system and
/// evolution engine depend on this trait so tests can substitute stubs.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// `OPENAI_API_KEY` was absent on first use.  Never retried.
    #[error("LLM credential missing: set OPENAI_API_KEY")]
    MissingCredential,

    /// Authentication or other 4xx failure.  Never retried.
    #[error("LLM request rejected ({status}): {message}")]
    Permanent { status: u16, message: String },

    /// Timeout, connection failure, or 5xx.  Retryable.
    #[error("LLM transport failure: {0}")]
    Transport(String),

    /// The body was readable but did not contain the JSON the caller asked
    /// for.  Retryable.
    #[error("LLM response was not valid JSON")]
    InvalidJson,

    /// Shutdown tripped while waiting on backoff or the request.
    #[error("LLM call cancelled")]
    Cancelled,

    /// Every attempt, including fallbacks, failed.
    #[error("LLM retries exhausted after {attempts} attempts; last error: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl LlmError {
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            LlmError::MissingCredential | LlmError::Permanent { .. } | LlmError::Cancelled
        )
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────────

/// One attempt against one named model.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn attempt(&self, model: &str, request: &CompletionRequest) -> Result<String, LlmError>;
}

/// Pure retry/fallback policy.  Holds no transport state, so it can be
/// driven against a scripted backend in tests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub fallback_models: Vec<String>,
    /// First backoff interval; doubles after every failed default-model
    /// attempt (1s, 2s, 4s, … in production).
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LiteLlmConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            fallback_models: config.fallback_models.clone(),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Upper bound on upstream calls a single `run` can make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + self.fallback_models.len() as u32
    }

    /// Drive `backend` until one attempt yields an acceptable body.
    ///
    /// Order: `max_retries` attempts against `default_model` with doubling
    /// backoff between them, then each fallback model once.  A permanent
    /// error short-circuits the whole sequence.
    pub async fn run(
        &self,
        backend: &dyn CompletionBackend,
        default_model: &str,
        request: &CompletionRequest,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<String, LlmError> {
        let mut attempts = 0u32;
        let mut last_error = String::new();
        let mut backoff = self.backoff_base;

        for try_index in 0..self.max_retries {
            if try_index > 0 {
                cancellable_sleep(backoff, shutdown).await?;
                backoff *= 2;
            }
            attempts += 1;
            match self.one_attempt(backend, default_model, request).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) => {
                    warn!(model = default_model, attempt = attempts, %err, "LLM attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        for fallback in &self.fallback_models {
            attempts += 1;
            match self.one_attempt(backend, fallback, request).await {
                Ok(body) => {
                    debug!(model = %fallback, "fallback model answered");
                    return Ok(body);
                }
                Err(err) if err.is_permanent() => return Err(err),
                Err(err) => {
                    warn!(model = %fallback, attempt = attempts, %err, "fallback attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        Err(LlmError::Exhausted {
            attempts,
            last: last_error,
        })
    }

    async fn one_attempt(
        &self,
        backend: &dyn CompletionBackend,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<String, LlmError> {
        let body = backend.attempt(model, request).await?;
        if request.require_json && extract_json_value(&body).is_none() {
            return Err(LlmError::InvalidJson);
        }
        Ok(body)
    }
}

async fn cancellable_sleep(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), LlmError> {
    if *shutdown.borrow() {
        return Err(LlmError::Cancelled);
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = shutdown.changed() => Err(LlmError::Cancelled),
    }
}

// ── HTTP backend ─────────────────────────────────────────────────────────────

/// OpenAI-compatible `/chat/completions` transport.  The base URL comes
/// from `OPENAI_BASE_URL` (default `https://api.openai.com/v1`); the key
/// from `OPENAI_API_KEY`, checked on every call so a missing credential is
/// an immediate, non-retried failure.
pub struct HttpCompletionBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCompletionBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn attempt(&self, model: &str, request: &CompletionRequest) -> Result<String, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::MissingCredential)?;

        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        if status.is_client_error() {
            return Err(LlmError::Permanent {
                status: status.as_u16(),
                message: body.to_string(),
            });
        }
        if !status.is_success() {
            return Err(LlmError::Transport(format!("{status}: {body}")));
        }

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::Transport(format!("response missing content: {body}")))
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Production [`LanguageModel`]: retry policy + HTTP backend + config.
pub struct LlmClient {
    backend: Box<dyn CompletionBackend>,
    policy: RetryPolicy,
    default_model: String,
    /// Minimum spacing between request starts, from `litellm.rate_limit`
    /// (requests per minute).  `None` disables throttling.
    min_interval: Option<Duration>,
    last_start: tokio::sync::Mutex<Option<tokio::time::Instant>>,
    shutdown: watch::Receiver<bool>,
}

impl LlmClient {
    pub fn new(config: &LiteLlmConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let backend = HttpCompletionBackend::new(Duration::from_secs(config.timeout.max(1)))?;
        Ok(Self {
            backend: Box::new(backend),
            policy: RetryPolicy::from_config(config),
            default_model: config.default_model.clone(),
            min_interval: rate_interval(config.rate_limit),
            last_start: tokio::sync::Mutex::new(None),
            shutdown,
        })
    }

    /// Swap the transport.  Used by tests and by deployments that front
    /// the model with a local proxy.
    pub fn with_backend(
        backend: Box<dyn CompletionBackend>,
        policy: RetryPolicy,
        default_model: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            policy,
            default_model: default_model.into(),
            min_interval: None,
            last_start: tokio::sync::Mutex::new(None),
            shutdown,
        }
    }

    pub fn with_rate_limit(mut self, requests_per_minute: u32) -> Self {
        self.min_interval = rate_interval(requests_per_minute);
        self
    }

    /// Hold the caller until the spacing window allows another request.
    async fn throttle(&self) {
        let Some(interval) = self.min_interval else {
            return;
        };
        let mut last_start = self.last_start.lock().await;
        let now = tokio::time::Instant::now();
        if let Some(previous) = *last_start {
            let ready_at = previous + interval;
            if ready_at > now {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_start = Some(tokio::time::Instant::now());
    }
}

fn rate_interval(requests_per_minute: u32) -> Option<Duration> {
    if requests_per_minute == 0 {
        None
    } else {
        Some(Duration::from_secs_f64(60.0 / requests_per_minute as f64))
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.throttle().await;
        let mut shutdown = self.shutdown.clone();
        self.policy
            .run(self.backend.as_ref(), &self.default_model, request, &mut shutdown)
            .await
    }
}

// ── JSON extraction ──────────────────────────────────────────────────────────

/// Pull the first JSON object out of a model reply.
///
/// Models frequently wrap JSON in a fenced ```json block or pad it with
/// prose; try the fence first, then the widest `{..}` span.
pub fn extract_json_value(response: &str) -> Option<serde_json::Value> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after_fence.find("```") {
            let candidate = after_fence[..fence_end].trim();
            if let Ok(value) = serde_json::from_str(candidate) {
                return Some(value);
            }
        }
    }

    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
            return Some(value);
        }
    }
    None
}

/// Typed variant of [`extract_json_value`].
pub fn extract_json<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    extract_json_value(response).and_then(|value| serde_json::from_value(value).ok())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted backend: pops one canned outcome per attempt and records the
    /// model each attempt was made against.
    struct ScriptedBackend {
        script: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn attempt(
            &self,
            model: &str,
            _request: &CompletionRequest,
        ) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(model.to_string());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(LlmError::Transport("script exhausted".to_string()));
            }
            script.remove(0)
        }
    }

    fn fast_policy(max_retries: u32, fallbacks: &[&str]) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            fallback_models: fallbacks.iter().map(ToString::to_string).collect(),
            backoff_base: Duration::from_millis(1),
        }
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn first_attempt_success_makes_one_call() {
        let backend = ScriptedBackend::new(vec![Ok("hello".to_string())]);
        let policy = fast_policy(3, &["fb"]);
        let (_tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi");

        let body = policy.run(&backend, "main", &request, &mut rx).await.unwrap();
        assert_eq!(body, "hello");
        assert_eq!(backend.calls(), vec!["main"]);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_fall_back() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Transport("boom".to_string())),
            Err(LlmError::Transport("boom".to_string())),
            Ok("saved by fallback".to_string()),
        ]);
        let policy = fast_policy(2, &["fb-a", "fb-b"]);
        let (_tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi");

        let body = policy.run(&backend, "main", &request, &mut rx).await.unwrap();
        assert_eq!(body, "saved by fallback");
        assert_eq!(backend.calls(), vec!["main", "main", "fb-a"]);
    }

    #[tokio::test]
    async fn attempt_count_is_bounded_by_retries_plus_fallbacks() {
        let backend = ScriptedBackend::new(vec![]);
        let policy = fast_policy(3, &["fb-a", "fb-b"]);
        let (_tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi");

        let err = policy.run(&backend, "main", &request, &mut rx).await.unwrap_err();
        assert_eq!(backend.calls().len(), policy.max_attempts() as usize);
        match err {
            LlmError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert!(last.contains("script exhausted"));
            }
            other => panic!("expected Exhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_counts_as_a_failed_attempt() {
        let backend = ScriptedBackend::new(vec![
            Ok("not json at all".to_string()),
            Ok("{\"keywords\": [\"a\"]}".to_string()),
        ]);
        let policy = fast_policy(3, &[]);
        let (_tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi").with_json();

        let body = policy.run(&backend, "main", &request, &mut rx).await.unwrap();
        assert!(body.contains("keywords"));
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn json_validation_applies_to_fallbacks_too() {
        let backend = ScriptedBackend::new(vec![
            Ok("still not json".to_string()),
            Ok("nope".to_string()),
        ]);
        let policy = fast_policy(1, &["fb"]);
        let (_tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi").with_json();

        let err = policy.run(&backend, "main", &request, &mut rx).await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::Permanent {
            status: 401,
            message: "bad key".to_string(),
        })]);
        let policy = fast_policy(3, &["fb"]);
        let (_tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi");

        let err = policy.run(&backend, "main", &request, &mut rx).await.unwrap_err();
        assert!(matches!(err, LlmError::Permanent { status: 401, .. }));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn missing_credential_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::MissingCredential)]);
        let policy = fast_policy(3, &["fb"]);
        let (_tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi");

        let err = policy.run(&backend, "main", &request, &mut rx).await.unwrap_err();
        assert!(matches!(err, LlmError::MissingCredential));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_backoff_wait() {
        let backend = ScriptedBackend::new(vec![
            Err(LlmError::Transport("boom".to_string())),
            Ok("too late".to_string()),
        ]);
        let policy = RetryPolicy {
            max_retries: 2,
            fallback_models: vec![],
            backoff_base: Duration::from_secs(30),
        };
        let (tx, mut rx) = shutdown_pair();
        let request = CompletionRequest::new("hi");

        let run = policy.run(&backend, "main", &request, &mut rx);
        tokio::pin!(run);
        // Let the first attempt fail, then trip shutdown during the backoff.
        tokio::select! {
            biased;
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            _ = &mut run => panic!("run should still be backing off"),
        }
        tx.send(true).unwrap();
        let err = run.await.unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_spaces_out_request_starts() {
        let backend = ScriptedBackend::new(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let (_tx, rx) = shutdown_pair();
        // 1200 requests/minute → 50 ms spacing.
        let client = LlmClient::with_backend(Box::new(backend), fast_policy(1, &[]), "m", rx)
            .with_rate_limit(1200);

        let started = tokio::time::Instant::now();
        client.complete(&CompletionRequest::new("one")).await.unwrap();
        client.complete(&CompletionRequest::new("two")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn rate_interval_disabled_at_zero() {
        assert_eq!(rate_interval(0), None);
        assert_eq!(rate_interval(60), Some(Duration::from_secs(1)));
    }

    // ── extract_json ───────────────────────────────────────────────────────

    #[test]
    fn extracts_fenced_json() {
        let raw = "Here you go:\n```json\n{\"context\": \"adds numbers\"}\n```";
        let value = extract_json_value(raw).unwrap();
        assert_eq!(value["context"], "adds numbers");
    }

    #[test]
    fn extracts_bare_json_with_prose() {
        let raw = "Sure! {\"tags\": [\"python\"]} hope that helps";
        let value = extract_json_value(raw).unwrap();
        assert_eq!(value["tags"][0], "python");
    }

    #[test]
    fn plain_text_yields_none() {
        assert!(extract_json_value("no json here").is_none());
        assert!(extract_json_value("").is_none());
    }

    #[test]
    fn typed_extraction() {
        #[derive(serde::Deserialize)]
        struct Analysis {
            keywords: Vec<String>,
        }
        let raw = "{\"keywords\": [\"sort\", \"merge\"]}";
        let analysis: Analysis = extract_json(raw).unwrap();
        assert_eq!(analysis.keywords, vec!["sort", "merge"]);
    }
}
