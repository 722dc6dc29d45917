use std::env;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use vitrine_contracts::data_uri::DataUri;
use vitrine_contracts::error::GenerationError;
use vitrine_contracts::events::{EventLog, GenerationEvent};
use vitrine_contracts::model::{
    AccessoryItem, GenerationSettings, ImageDescriptor, SubjectPhoto, MAX_ITEMS, MAX_SCALE,
    MIN_SCALE,
};
use vitrine_contracts::models::ModelSpec;
use vitrine_contracts::prompt::{compose_initial_prompt, compose_refine_prompt};
use vitrine_contracts::response::{interpret, parts_from_gemini_response, Interpretation, ResponsePart};
use vitrine_contracts::session::Operation;

const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const UPSTREAM_MESSAGE_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    InlineImage { media_type: String, data: String },
    Text(String),
}

impl RequestPart {
    fn image(image: &ImageDescriptor) -> Self {
        Self::InlineImage {
            media_type: image.media_type.clone(),
            data: image.encoded_data.clone(),
        }
    }

    fn to_gemini_json(&self) -> Value {
        match self {
            Self::InlineImage { media_type, data } => json!({
                "inlineData": {
                    "mimeType": media_type,
                    "data": data,
                }
            }),
            Self::Text(text) => json!({ "text": text }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub parts: Vec<RequestPart>,
}

impl ModelRequest {
    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part, RequestPart::InlineImage { .. }))
            .count()
    }

    pub fn prompt_text(&self) -> &str {
        self.parts
            .iter()
            .rev()
            .find_map(|part| match part {
                RequestPart::Text(text) => Some(text.as_str()),
                RequestPart::InlineImage { .. } => None,
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub parts: Vec<ResponsePart>,
    pub finish_reason: Option<String>,
    pub block_reason: Option<String>,
}

/// External generative-image model. One call, one complete response.
pub trait ImageModel: Send + Sync {
    fn name(&self) -> &str;
    fn generate_content(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

pub fn client_for_model(spec: &ModelSpec, config: GeminiConfig) -> Result<Box<dyn ImageModel>> {
    match spec.provider.as_str() {
        "gemini" => Ok(Box::new(GeminiClient::new(config))),
        "dryrun" => Ok(Box::new(DryrunClient)),
        other => bail!("no image client for provider '{other}' (model {})", spec.name),
    }
}

/// Packages generation and refinement requests for an `ImageModel` and
/// interprets what comes back.
pub struct GenerationAdapter {
    client: Box<dyn ImageModel>,
    model: String,
    events: Option<EventLog>,
}

impl GenerationAdapter {
    pub fn new(client: Box<dyn ImageModel>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn generate(
        &self,
        subject: Option<&SubjectPhoto>,
        items: &[AccessoryItem],
        settings: &GenerationSettings,
    ) -> Result<Interpretation, GenerationError> {
        let subject = match validate_generate(subject, items) {
            Ok(subject) => subject,
            Err(err) => return Err(self.record_failure(Operation::Generate, err)),
        };

        let prompt = compose_initial_prompt(subject, items, settings);
        let mut parts = Vec::with_capacity(items.len() + 2);
        parts.push(RequestPart::image(subject.image()));
        parts.extend(
            items
                .iter()
                .filter_map(|item| item.image.as_ref())
                .map(RequestPart::image),
        );
        parts.push(RequestPart::Text(prompt));
        self.dispatch(Operation::Generate, parts)
    }

    pub fn refine(
        &self,
        subject: Option<&SubjectPhoto>,
        prior_result: Option<&str>,
        instruction: &str,
    ) -> Result<Interpretation, GenerationError> {
        let (subject, prior) = match validate_refine(subject, prior_result, instruction) {
            Ok(valid) => valid,
            Err(err) => return Err(self.record_failure(Operation::Refine, err)),
        };

        let prompt = compose_refine_prompt(subject, instruction);
        let parts = vec![
            RequestPart::image(subject.image()),
            RequestPart::InlineImage {
                media_type: prior.media_type,
                data: prior.payload,
            },
            RequestPart::Text(prompt),
        ];
        self.dispatch(Operation::Refine, parts)
    }

    fn dispatch(
        &self,
        operation: Operation,
        parts: Vec<RequestPart>,
    ) -> Result<Interpretation, GenerationError> {
        let request = ModelRequest {
            model: self.model.clone(),
            parts,
        };
        let prompt = request.prompt_text();
        self.record(GenerationEvent::GenerationRequested {
            operation,
            model: request.model.clone(),
            client: self.client.name().to_string(),
            image_count: request.image_count(),
            prompt_chars: prompt.chars().count(),
            prompt_sha256: sha256_hex(prompt),
        });

        let response = match self.client.generate_content(&request) {
            Ok(response) => response,
            Err(err) => {
                let upstream =
                    GenerationError::Upstream(error_chain_text(&err, UPSTREAM_MESSAGE_MAX_CHARS));
                return Err(self.record_failure(operation, upstream));
            }
        };

        match interpret(&response.parts) {
            Ok(interpretation) => {
                let result = interpretation.result.as_ref();
                self.record(GenerationEvent::GenerationFinished {
                    operation,
                    media_type: interpretation.image.media_type.clone(),
                    status: result.map(|row| row.status.as_str().to_string()),
                    placements: result.map(|row| row.placements.len()).unwrap_or(0),
                    semantic_issue: interpretation.semantic_issue(),
                    finish_reason: response.finish_reason,
                });
                Ok(interpretation)
            }
            Err(err) => {
                if response.block_reason.is_some() || response.finish_reason.is_some() {
                    self.record(GenerationEvent::ModelDiagnostics {
                        operation,
                        finish_reason: response.finish_reason,
                        block_reason: response.block_reason,
                    });
                }
                Err(self.record_failure(operation, err))
            }
        }
    }

    fn record_failure(&self, operation: Operation, err: GenerationError) -> GenerationError {
        let raw_text = match &err {
            GenerationError::MalformedJson { raw, .. } => Some(truncate_text(raw, 512)),
            _ => None,
        };
        self.record(GenerationEvent::GenerationFailed {
            operation,
            kind: err.kind().to_string(),
            message: err.to_string(),
            raw_text,
        });
        err
    }

    fn record(&self, event: GenerationEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.record(&event) {
            eprintln!("vitrine: failed to write event log: {err:#}");
        }
    }
}

fn validate_generate<'a>(
    subject: Option<&'a SubjectPhoto>,
    items: &[AccessoryItem],
) -> Result<&'a SubjectPhoto, GenerationError> {
    let Some(subject) = subject else {
        return Err(GenerationError::invalid("a subject photo is required"));
    };
    if items.is_empty() {
        return Err(GenerationError::invalid(
            "at least one accessory item is required",
        ));
    }
    if items.len() > MAX_ITEMS {
        return Err(GenerationError::invalid(format!(
            "at most {MAX_ITEMS} accessory items are supported (got {})",
            items.len()
        )));
    }
    for (index, item) in items.iter().enumerate() {
        if item.image.is_none() {
            return Err(GenerationError::invalid(format!(
                "accessory item {} ({}) has no image",
                index + 1,
                item.kind
            )));
        }
        if !item.scale_in_range() {
            return Err(GenerationError::invalid(format!(
                "accessory item {} scale {} is outside [{MIN_SCALE}, {MAX_SCALE}]",
                index + 1,
                item.scale
            )));
        }
    }
    Ok(subject)
}

fn validate_refine<'a>(
    subject: Option<&'a SubjectPhoto>,
    prior_result: Option<&str>,
    instruction: &str,
) -> Result<(&'a SubjectPhoto, DataUri), GenerationError> {
    if instruction.trim().is_empty() {
        return Err(GenerationError::invalid("the refinement instruction is empty"));
    }
    let Some(subject) = subject else {
        return Err(GenerationError::invalid("a subject photo is required"));
    };
    let Some(prior_result) = prior_result.filter(|value| !value.trim().is_empty()) else {
        return Err(GenerationError::invalid(
            "there is no previous result to refine",
        ));
    };
    let Some(prior) = DataUri::parse(prior_result) else {
        return Err(GenerationError::invalid(
            "the previous result is not a base64 data URI",
        ));
    };
    Ok((subject, prior))
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub transport_retries: usize,
    pub retry_backoff: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            api_key: None,
            timeout: Duration::from_secs(90),
            transport_retries: 0,
            retry_backoff: Duration::from_millis(1200),
        }
    }
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            api_key: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            ..Self::default()
        }
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        let seconds = if seconds.is_finite() { seconds } else { 90.0 };
        self.timeout = Duration::from_secs_f64(seconds.clamp(15.0, 300.0));
        self
    }

    pub fn with_transport_retries(mut self, retries: usize) -> Self {
        self.transport_retries = retries.min(4);
        self
    }
}

pub struct GeminiClient {
    config: GeminiConfig,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.config.api_base, model_path)
    }

    fn build_payload(request: &ModelRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": request
                    .parts
                    .iter()
                    .map(RequestPart::to_gemini_json)
                    .collect::<Vec<Value>>(),
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        })
    }

    fn response_from_payload(payload: &Value) -> ModelResponse {
        let finish_reason = payload
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let block_reason = payload
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .map(str::to_string);
        ModelResponse {
            parts: parts_from_gemini_response(payload),
            finish_reason,
            block_reason,
        }
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        let max_retries = self.config.transport_retries;
        for attempt in 0..=max_retries {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(self.config.timeout)
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    eprintln!(
                        "vitrine: Gemini transport retry {}/{} after transient request failure",
                        attempt + 1,
                        max_retries
                    );
                    thread::sleep(self.config.retry_backoff * (attempt as u32 + 1));
                }
            }
        }

        unreachable!("Gemini transport retry loop should always return a response or error")
    }
}

impl ImageModel for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_content(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = Self::build_payload(request);
        let response = self.post_with_transport_retries(&endpoint, api_key, &payload)?;
        let response_payload = response_json_or_error("Gemini", response)?;
        Ok(Self::response_from_payload(&response_payload))
    }
}

/// Offline stand-in: answers with a flat-colored PNG the size of the first
/// input image plus a fenced `ok` JSON block.
pub struct DryrunClient;

impl ImageModel for DryrunClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_content(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let images = request
            .parts
            .iter()
            .filter_map(|part| match part {
                RequestPart::InlineImage { data, .. } => Some(data.as_str()),
                RequestPart::Text(_) => None,
            })
            .collect::<Vec<&str>>();
        let (width, height) = images
            .first()
            .and_then(|data| BASE64.decode(data.as_bytes()).ok())
            .and_then(|bytes| image_dimensions_from_bytes(&bytes).ok())
            .unwrap_or((512, 512));

        let (r, g, b) = color_from_prompt(request.prompt_text());
        let canvas = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
        let mut encoded = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut encoded, ImageFormat::Png)
            .context("dryrun image encode failed")?;

        let placements = (1..images.len())
            .map(|idx| {
                json!({
                    "item_index": idx - 1,
                    "categoria": "dryrun",
                    "confidence": 1.0,
                })
            })
            .collect::<Vec<Value>>();
        let report = json!({
            "status": "ok",
            "summary": format!("Dryrun composite of {} input images.", images.len()),
            "placements": placements,
            "debug": { "notes": format!("model {}", request.model) },
        });

        Ok(ModelResponse {
            parts: vec![
                ResponsePart::InlineImage {
                    media_type: "image/png".to_string(),
                    data: BASE64.encode(encoded.into_inner()),
                },
                ResponsePart::Text(format!(
                    "```json\n{}\n```",
                    serde_json::to_string_pretty(&report)?
                )),
            ],
            finish_reason: Some("STOP".to_string()),
            block_reason: None,
        })
    }
}

/// Reads a PNG or JPEG from disk. Content is sniffed; other formats are
/// rejected.
pub fn load_image(path: &Path) -> Result<ImageDescriptor> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let media_type = media_type_for_bytes(&bytes)
        .with_context(|| format!("{}: unsupported image type", path.display()))?;
    let (width, height) = image_dimensions_from_bytes(&bytes)
        .with_context(|| format!("failed decoding {}", path.display()))?;
    let display_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    Ok(ImageDescriptor::new(display_name, BASE64.encode(&bytes), media_type)
        .with_dimensions(width, height))
}

pub fn load_subject(path: &Path) -> Result<SubjectPhoto> {
    let image = load_image(path)?;
    SubjectPhoto::from_descriptor(image)
        .ok_or_else(|| anyhow!("{}: subject dimensions unavailable", path.display()))
}

pub fn data_uri_from_path(path: &Path) -> Result<String> {
    let image = load_image(path)?;
    Ok(DataUri::new(image.media_type, image.encoded_data).to_string())
}

pub fn write_result_image(path: &Path, interpretation: &Interpretation) -> Result<()> {
    let bytes = BASE64
        .decode(interpretation.image.payload.as_bytes())
        .context("result image base64 decode failed")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn media_type_for_bytes(bytes: &[u8]) -> Result<&'static str> {
    match image::guess_format(bytes)? {
        ImageFormat::Png => Ok("image/png"),
        ImageFormat::Jpeg => Ok("image/jpeg"),
        other => bail!("{other:?} images are not accepted; use PNG or JPEG"),
    }
}

fn image_dimensions_from_bytes(bytes: &[u8]) -> Result<(u32, u32)> {
    let dims = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?;
    Ok(dims)
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}
