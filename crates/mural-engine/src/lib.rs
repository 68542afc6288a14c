use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mural_contracts::events::{EventPayload, EventWriter};
use mural_contracts::outcome::{BatchOutcome, ErrorKind, ItemOutcome};
use mural_contracts::prompt::{sanitize_prompt, validate_style_content};
use mural_contracts::request::{AspectRatio, BatchRequest};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

/// Substrings that mark an upstream failure as transient. The service has
/// no structured error taxonomy, so classification is a best-effort match
/// over its error text; upstream wording changes will change behavior here.
const RETRYABLE_ERRORS: [&str; 7] = [
    "rate limit",
    "429",
    "503",
    "502",
    "connection",
    "timeout",
    "temporarily unavailable",
];

pub fn is_retryable_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_ERRORS.iter().any(|pattern| lower.contains(pattern))
}

/// Terminal kind for a retryable error whose budget ran out.
pub fn exhausted_kind(message: &str) -> ErrorKind {
    if message.to_lowercase().contains("rate") {
        ErrorKind::RateLimited
    } else {
        ErrorKind::NetworkError
    }
}

/// Exponential backoff between retry attempts. Pure and deterministic:
/// `delay(attempt) = min(base * 2^attempt, cap)`, attempt zero-indexed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_seconds: 1.0,
            max_delay_seconds: 60.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay_seconds * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(exponential.min(self.max_delay_seconds))
    }
}

/// Terminal result of one retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, retries_used: u32 },
    Failure {
        kind: ErrorKind,
        error: String,
        retries_used: u32,
    },
}

/// Drive one fallible operation to a terminal outcome.
///
/// Makes at most `max_retries + 1` attempts. Non-retryable errors terminate
/// immediately as `ApiError` regardless of remaining budget. Before each
/// re-attempt the observer is called with the 1-based retry number, the
/// backoff delay, and the error text, then the thread sleeps for the delay;
/// this is the batch's only intentional suspension point.
pub fn run_with_retry<T>(
    policy: &RetryPolicy,
    max_retries: u32,
    mut on_retry: impl FnMut(u32, Duration, &str),
    mut operation: impl FnMut() -> Result<T>,
) -> RetryOutcome<T> {
    let mut retries_used = 0;
    let mut last_error = String::new();

    for attempt in 0..=max_retries {
        match operation() {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    retries_used,
                }
            }
            Err(err) => {
                last_error = format!("{err:#}");
                if !is_retryable_error(&last_error) {
                    return RetryOutcome::Failure {
                        kind: ErrorKind::ApiError,
                        error: last_error,
                        retries_used,
                    };
                }
                if attempt < max_retries {
                    let delay = policy.delay(attempt);
                    on_retry(attempt + 1, delay, &last_error);
                    thread::sleep(delay);
                    retries_used += 1;
                }
            }
        }
    }

    RetryOutcome::Failure {
        kind: exhausted_kind(&last_error),
        error: format!("Failed after {max_retries} retries: {last_error}"),
        retries_used,
    }
}

/// Image bytes plus the media type inferred from the file extension,
/// loaded once per batch and shared read-only across items.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

fn load_attachment(path: &Path) -> Result<ImageAttachment> {
    if !path.exists() {
        bail!("Image not found: {}", path.display());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(ImageAttachment {
        bytes,
        mime_type: mime_for_path(path),
    })
}

fn load_style(path: &Path) -> Result<(String, Vec<String>)> {
    if !path.exists() {
        bail!("Style file not found: {}", path.display());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let (_looks_clean, warnings) = validate_style_content(&content);
    Ok((content, warnings))
}

/// One unit of work: a single sanitized prompt with the batch's shared
/// inputs held by reference. Built per prompt inside the batch loop.
#[derive(Debug)]
pub struct GenerationRequest<'a> {
    pub prompt: String,
    pub output: PathBuf,
    pub style_text: Option<&'a str>,
    pub edit: Option<&'a ImageAttachment>,
    pub references: &'a [ImageAttachment],
    pub aspect_ratio: AspectRatio,
    pub model: &'a str,
}

impl GenerationRequest<'_> {
    /// Final prompt text sent upstream, with the style template prepended
    /// when one is set.
    pub fn final_prompt(&self) -> String {
        match self.style_text {
            Some(style) => format!("{style}\n\nGenerate: {}", self.prompt),
            None => self.prompt.clone(),
        }
    }
}

/// Raw image returned by a backend.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

pub trait ImageBackend {
    fn generate(&self, request: &GenerationRequest) -> Result<ImagePayload>;
}

impl<B: ImageBackend + ?Sized> ImageBackend for &B {
    fn generate(&self, request: &GenerationRequest) -> Result<ImagePayload> {
        (**self).generate(request)
    }
}

/// Blocking client for the Gemini `generateContent` endpoint.
pub struct GeminiBackend {
    api_base: String,
    api_key: String,
    http: HttpClient,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(api_key: String, timeout_seconds: u64) -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
            http: HttpClient::new(),
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn extract_image(response_payload: &Value) -> Result<ImagePayload> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .context("Gemini image base64 decode failed")?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Ok(ImagePayload { bytes, mime_type });
            }
        }

        bail!("No image in response")
    }
}

fn inline_data_part(attachment: &ImageAttachment) -> Value {
    json!({
        "inlineData": {
            "mimeType": attachment.mime_type,
            "data": BASE64.encode(&attachment.bytes),
        }
    })
}

/// `generateContent` request body: prompt text first, then the edit source,
/// then the reference images, image-only output at the requested ratio.
fn build_generation_payload(request: &GenerationRequest) -> Value {
    let mut parts = vec![json!({ "text": request.final_prompt() })];
    if let Some(edit) = request.edit {
        parts.push(inline_data_part(edit));
    }
    for reference in request.references {
        parts.push(inline_data_part(reference));
    }
    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }],
        "generationConfig": {
            "responseModalities": ["IMAGE"],
            "imageConfig": {
                "aspectRatio": request.aspect_ratio.as_str(),
            },
        },
    })
}

impl ImageBackend for GeminiBackend {
    fn generate(&self, request: &GenerationRequest) -> Result<ImagePayload> {
        let endpoint = self.endpoint_for_model(request.model);
        let payload = build_generation_payload(request);

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;

        let status = response.status();
        let body = response
            .text()
            .context("Gemini response body read failed")?;
        if !status.is_success() {
            bail!(
                "Gemini request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }

        let response_payload: Value =
            serde_json::from_str(&body).context("Gemini returned invalid JSON payload")?;
        Self::extract_image(&response_payload)
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Output path for item `index` (1-based). A single-prompt batch uses the
/// given path verbatim; larger batches get `_001`, `_002`, ... inserted
/// before the extension.
fn numbered_output_path(base: &Path, index: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("output");
    let parent = base.parent().map(Path::to_path_buf).unwrap_or_default();
    match base.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => parent.join(format!("{stem}_{index:03}.{ext}")),
        None => parent.join(format!("{stem}_{index:03}")),
    }
}

fn write_image(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Sequential batch orchestrator: loads shared inputs once, then drives one
/// retried generation per prompt, in input order, aggregating the outcomes.
pub struct BatchRunner<'a, B: ImageBackend> {
    backend: B,
    policy: RetryPolicy,
    events: Option<&'a EventWriter>,
}

impl<'a, B: ImageBackend> BatchRunner<'a, B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<&'a EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    // Events are advisory observability; a failed append never affects the
    // batch outcome.
    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(events) = self.events {
            let _ = events.emit(event_type, payload);
        }
    }

    fn fatal(&self, kind: ErrorKind, error: String, total: u64) -> BatchOutcome {
        let mut payload = Map::new();
        payload.insert("error_code".to_string(), json!(kind.code()));
        payload.insert("error".to_string(), json!(&error));
        self.emit("batch_failed", payload);
        BatchOutcome::fatal(kind, error, total)
    }

    pub fn run(&self, request: &BatchRequest) -> BatchOutcome {
        let total = request.prompts.len() as u64;

        let mut payload = Map::new();
        payload.insert("prompts".to_string(), json!(total));
        payload.insert("output".to_string(), json!(request.output.display().to_string()));
        payload.insert("model".to_string(), json!(request.model));
        self.emit("batch_started", payload);

        // Shared inputs load once; a missing file aborts before any item.
        let style_text = match &request.style {
            Some(path) => match load_style(path) {
                Ok((content, warnings)) => {
                    for warning in warnings {
                        let mut payload = Map::new();
                        payload.insert("warning".to_string(), json!(warning));
                        self.emit("style_warning", payload);
                    }
                    Some(content)
                }
                Err(err) => return self.fatal(ErrorKind::FileNotFound, format!("{err:#}"), total),
            },
            None => None,
        };

        let edit = match &request.edit {
            Some(path) => match load_attachment(path) {
                Ok(attachment) => Some(attachment),
                Err(err) => return self.fatal(ErrorKind::FileNotFound, format!("{err:#}"), total),
            },
            None => None,
        };

        let mut references = Vec::new();
        for path in &request.references {
            match load_attachment(path) {
                Ok(attachment) => references.push(attachment),
                Err(err) => return self.fatal(ErrorKind::FileNotFound, format!("{err:#}"), total),
            }
        }

        let mut results: Vec<ItemOutcome> = Vec::with_capacity(request.prompts.len());
        for (index, prompt) in request.prompts.iter().enumerate() {
            let mut payload = Map::new();
            payload.insert("index".to_string(), json!(index));
            payload.insert("prompt".to_string(), json!(prompt));
            self.emit("item_started", payload);

            // Sanitizer failures are item-local and never consume retries.
            let safe_prompt = match sanitize_prompt(prompt) {
                Ok(safe) => safe,
                Err(err) => {
                    let outcome =
                        ItemOutcome::failed(prompt, ErrorKind::InvalidInput, err.to_string(), 0);
                    self.emit_item_completed(index, &outcome);
                    results.push(outcome);
                    continue;
                }
            };

            let output = if request.prompts.len() > 1 {
                numbered_output_path(&request.output, index + 1)
            } else {
                request.output.clone()
            };

            let generation = GenerationRequest {
                prompt: safe_prompt,
                output: output.clone(),
                style_text: style_text.as_deref(),
                edit: edit.as_ref(),
                references: &references,
                aspect_ratio: request.aspect_ratio,
                model: &request.model,
            };

            let retry_result = run_with_retry(
                &self.policy,
                request.max_retries,
                |retry, delay, error| {
                    let mut payload = Map::new();
                    payload.insert("index".to_string(), json!(index));
                    payload.insert("retry".to_string(), json!(retry));
                    payload.insert("max_retries".to_string(), json!(request.max_retries));
                    payload.insert("delay_s".to_string(), json!(delay.as_secs_f64()));
                    payload.insert(
                        "message".to_string(),
                        json!(format!(
                            "Retry {retry}/{} after {:.1}s: {error}",
                            request.max_retries,
                            delay.as_secs_f64()
                        )),
                    );
                    self.emit("item_retry", payload);
                },
                || {
                    let image = self.backend.generate(&generation)?;
                    write_image(&generation.output, &image.bytes)?;
                    Ok(output.clone())
                },
            );

            let outcome = match retry_result {
                RetryOutcome::Success {
                    value,
                    retries_used,
                } => ItemOutcome::succeeded(prompt, value, retries_used),
                RetryOutcome::Failure {
                    kind,
                    error,
                    retries_used,
                } => ItemOutcome::failed(prompt, kind, error, retries_used),
            };
            self.emit_item_completed(index, &outcome);
            results.push(outcome);
        }

        let batch = BatchOutcome::from_items(results);
        let mut payload = Map::new();
        payload.insert("succeeded".to_string(), json!(batch.succeeded));
        payload.insert("failed".to_string(), json!(batch.failed));
        payload.insert("retries_used".to_string(), json!(batch.retries_used));
        self.emit("batch_finished", payload);
        batch
    }

    fn emit_item_completed(&self, index: usize, outcome: &ItemOutcome) {
        let mut payload = Map::new();
        payload.insert("index".to_string(), json!(index));
        payload.insert("success".to_string(), json!(outcome.success));
        payload.insert("error_code".to_string(), json!(outcome.error_code.code()));
        if let Some(error) = &outcome.error {
            payload.insert("error".to_string(), json!(error));
        }
        if let Some(output) = &outcome.output {
            payload.insert("output".to_string(), json!(output.display().to_string()));
        }
        payload.insert("retries_used".to_string(), json!(outcome.retries_used));
        self.emit("item_completed", payload);
    }
}

/// Resolve the credential and run the batch against the live Gemini
/// backend. A missing credential short-circuits before any other work.
pub fn generate_batch(request: &BatchRequest, events: Option<&EventWriter>) -> BatchOutcome {
    let Some(api_key) = non_empty_env("GEMINI_API_KEY") else {
        let outcome = BatchOutcome::fatal(
            ErrorKind::ApiKeyMissing,
            "GEMINI_API_KEY not set",
            request.prompts.len() as u64,
        );
        if let Some(events) = events {
            let mut payload = Map::new();
            payload.insert("error_code".to_string(), json!(ErrorKind::ApiKeyMissing.code()));
            payload.insert("error".to_string(), json!("GEMINI_API_KEY not set"));
            let _ = events.emit("batch_failed", payload);
        }
        return outcome;
    };

    let backend = GeminiBackend::new(api_key, request.timeout_seconds);
    BatchRunner::new(backend).with_events(events).run(request)
}
