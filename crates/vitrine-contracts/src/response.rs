use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::data_uri::{DataUri, DEFAULT_MEDIA_TYPE};
use crate::error::GenerationError;

const JSON_FENCE_OPEN: &str = "```json\n";
const JSON_FENCE_CLOSE: &str = "\n```";
const DEFAULT_ISSUE_MESSAGE: &str = "The model reported a problem with the input.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    InlineImage { media_type: String, data: String },
    Text(String),
}

impl ResponsePart {
    /// Maps one Gemini `parts[*]` entry. Thought parts and shapes that carry
    /// neither inline data nor text yield `None`.
    pub fn from_gemini_json(part: &Value) -> Option<Self> {
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            return None;
        }
        if let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        {
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                return None;
            }
            let media_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_MEDIA_TYPE);
            return Some(Self::InlineImage {
                media_type: media_type.to_string(),
                data: data.to_string(),
            });
        }
        part.get("text")
            .and_then(Value::as_str)
            .map(|text| Self::Text(text.to_string()))
    }
}

/// Content parts of the first candidate of a `generateContent` payload.
pub fn parts_from_gemini_response(payload: &Value) -> Vec<ResponsePart> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(ResponsePart::from_gemini_json)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultStatus {
    Ok,
    NeedsInput,
    Error,
    Other(String),
}

impl Serialize for ResultStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl ResultStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "ok" => Self::Ok,
            "needs_input" => Self::NeedsInput,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ok => "ok",
            Self::NeedsInput => "needs_input",
            Self::Error => "error",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub item_index: i64,
    pub category: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub status: ResultStatus,
    pub summary: String,
    pub placements: Vec<Placement>,
    pub debug_notes: String,
    #[serde(skip)]
    pub raw: Value,
}

impl GenerationResult {
    /// Reads the advisory schema leniently: missing or mistyped fields fall
    /// back to empty values instead of failing.
    pub fn from_value(raw: Value) -> Self {
        let status = ResultStatus::parse(
            raw.get("status")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        let summary = raw
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let placements = raw
            .get("placements")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(placement_from_value).collect())
            .unwrap_or_default();
        let debug_notes = match raw.get("debug") {
            Some(Value::Object(debug)) => debug
                .get("notes")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some(Value::String(notes)) => notes.clone(),
            _ => String::new(),
        };
        Self {
            status,
            summary,
            placements,
            debug_notes,
            raw,
        }
    }
}

fn placement_from_value(row: &Value) -> Option<Placement> {
    let row = row.as_object()?;
    let item_index = row
        .get("item_index")
        .and_then(|value| value.as_i64().or_else(|| value.as_f64().map(|v| v as i64)))
        .unwrap_or_default();
    let category = row
        .get("categoria")
        .or_else(|| row.get("category"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let confidence = row
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or_default();
    Some(Placement {
        item_index,
        category,
        confidence,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub image: DataUri,
    pub result: Option<GenerationResult>,
}

impl Interpretation {
    pub fn image_data_uri(&self) -> String {
        self.image.to_string()
    }

    /// Summary to show as a warning when the model parsed fine but reported
    /// `needs_input` or `error`.
    pub fn semantic_issue(&self) -> Option<String> {
        let result = self.result.as_ref()?;
        if !matches!(result.status, ResultStatus::NeedsInput | ResultStatus::Error) {
            return None;
        }
        let summary = result.summary.trim();
        if summary.is_empty() {
            return Some(DEFAULT_ISSUE_MESSAGE.to_string());
        }
        Some(summary.to_string())
    }
}

/// Body of the first ```` ```json ```` fence, or the trimmed text when there
/// is none.
pub fn extract_json_text(text: &str) -> &str {
    if let Some(start) = text.find(JSON_FENCE_OPEN) {
        let body_start = start + JSON_FENCE_OPEN.len();
        if let Some(len) = text[body_start..].find(JSON_FENCE_CLOSE) {
            return &text[body_start..body_start + len];
        }
    }
    text.trim()
}

/// Single in-order scan of the response parts.
///
/// The first inline image wins; later images are ignored. The first text
/// part that fails to parse as JSON aborts the scan with `MalformedJson`,
/// even when an image would have followed. When several text parts parse,
/// the last one wins.
pub fn interpret(parts: &[ResponsePart]) -> Result<Interpretation, GenerationError> {
    let mut image: Option<DataUri> = None;
    let mut result: Option<GenerationResult> = None;

    for part in parts {
        match part {
            ResponsePart::InlineImage { media_type, data } => {
                if image.is_none() {
                    image = Some(DataUri::new(media_type.as_str(), data.as_str()));
                }
            }
            ResponsePart::Text(text) => {
                if text.is_empty() {
                    continue;
                }
                let parsed = serde_json::from_str::<Value>(extract_json_text(text)).map_err(
                    |err| GenerationError::MalformedJson {
                        raw: text.clone(),
                        message: err.to_string(),
                    },
                )?;
                result = Some(GenerationResult::from_value(parsed));
            }
        }
    }

    let Some(image) = image else {
        return Err(GenerationError::NoImageReturned);
    };
    Ok(Interpretation { image, result })
}
