use serde::Serialize;

use crate::error::GenerationError;
use crate::response::Interpretation;

pub const LOADING_MESSAGES: &[&str] = &[
    "Analyzing the scene lighting...",
    "Studying anatomical proportions...",
    "Determining the material properties of the item...",
    "Adjusting the item scale for a perfect fit...",
    "Mapping lights and shadows for extra realism...",
    "Generating reflections consistent with the environment...",
    "Casting subtle shadows on the skin...",
    "Finalizing the image composition...",
];

pub fn loading_message(tick: usize) -> &'static str {
    LOADING_MESSAGES[tick % LOADING_MESSAGES.len()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitting,
    Success,
    Refining,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Generate,
    Refine,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Refine => "refine",
        }
    }
}

/// Identifies one in-flight request. Only the newest ticket may complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    seq: u64,
    operation: Operation,
}

impl Ticket {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub phase: Phase,
    pub result: Option<Interpretation>,
    pub error: Option<String>,
    pub warning: Option<String>,
    seq: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            result: None,
            error: None,
            warning: None,
            seq: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.phase, Phase::Submitting | Phase::Refining)
    }

    /// A fresh submission drops the previous result entirely.
    pub fn start_submit(&self) -> (Self, Ticket) {
        let seq = self.seq + 1;
        let next = Self {
            phase: Phase::Submitting,
            result: None,
            error: None,
            warning: None,
            seq,
        };
        (
            next,
            Ticket {
                seq,
                operation: Operation::Generate,
            },
        )
    }

    /// Refining keeps the current result on screen until the new one lands.
    pub fn start_refine(&self) -> (Self, Ticket) {
        let seq = self.seq + 1;
        let next = Self {
            phase: Phase::Refining,
            result: self.result.clone(),
            error: None,
            warning: self.warning.clone(),
            seq,
        };
        (
            next,
            Ticket {
                seq,
                operation: Operation::Refine,
            },
        )
    }

    /// Applies an outcome. Outcomes for superseded tickets are discarded.
    pub fn complete(
        &self,
        ticket: Ticket,
        outcome: Result<Interpretation, GenerationError>,
    ) -> Self {
        if ticket.seq != self.seq || !self.is_busy() {
            return self.clone();
        }
        match outcome {
            Ok(interpretation) => Self {
                phase: Phase::Success,
                warning: interpretation.semantic_issue(),
                result: Some(interpretation),
                error: None,
                seq: self.seq,
            },
            Err(err) => Self {
                phase: Phase::Error,
                result: self.result.clone(),
                error: Some(user_message(ticket.operation, &err)),
                warning: None,
                seq: self.seq,
            },
        }
    }

    /// Precondition failure caught by the shell before any request.
    pub fn reject(&self, message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Error,
            result: self.result.clone(),
            error: Some(message.into()),
            warning: None,
            seq: self.seq,
        }
    }
}

pub fn user_message(operation: Operation, err: &GenerationError) -> String {
    match err {
        GenerationError::InvalidRequest(message) => message.clone(),
        GenerationError::Upstream(message) => match operation {
            Operation::Generate => {
                format!("An error occurred while contacting the image model: {message}")
            }
            Operation::Refine => format!("An error occurred during refinement: {message}"),
        },
        GenerationError::NoImageReturned => {
            "The model response did not contain an image.".to_string()
        }
        GenerationError::MalformedJson { .. } => {
            "Could not process the model response (invalid JSON).".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_uri::DataUri;
    use crate::response::{GenerationResult, ResultStatus};

    fn success(payload: &str) -> Interpretation {
        Interpretation {
            image: DataUri::new("image/png", payload),
            result: None,
        }
    }

    #[test]
    fn submit_then_success() {
        let idle = SessionState::new();
        let (submitting, ticket) = idle.start_submit();
        assert_eq!(submitting.phase, Phase::Submitting);
        assert!(submitting.is_busy());

        let done = submitting.complete(ticket, Ok(success("QUJD")));
        assert_eq!(done.phase, Phase::Success);
        assert_eq!(
            done.result.as_ref().map(Interpretation::image_data_uri).as_deref(),
            Some("data:image/png;base64,QUJD")
        );
        assert!(done.error.is_none());
    }

    #[test]
    fn refine_failure_keeps_previous_result() {
        let (submitting, ticket) = SessionState::new().start_submit();
        let done = submitting.complete(ticket, Ok(success("QUJD")));

        let (refining, ticket) = done.start_refine();
        assert_eq!(refining.phase, Phase::Refining);
        assert!(refining.result.is_some());

        let failed = refining.complete(
            ticket,
            Err(GenerationError::Upstream("quota exceeded".to_string())),
        );
        assert_eq!(failed.phase, Phase::Error);
        assert_eq!(
            failed.error.as_deref(),
            Some("An error occurred during refinement: quota exceeded")
        );
        assert_eq!(failed.result, done.result);
    }

    #[test]
    fn stale_ticket_outcome_is_discarded() {
        let (first, stale) = SessionState::new().start_submit();
        let (second, current) = first.start_submit();

        let unchanged = second.complete(stale, Ok(success("T0xE")));
        assert_eq!(unchanged, second);

        let done = unchanged.complete(current, Ok(success("TkVX")));
        assert_eq!(done.result.map(|result| result.image.payload).as_deref(), Some("TkVX"));
    }

    #[test]
    fn completing_twice_is_ignored() {
        let (submitting, ticket) = SessionState::new().start_submit();
        let done = submitting.complete(ticket, Ok(success("QUJD")));
        let again = done.complete(ticket, Err(GenerationError::NoImageReturned));
        assert_eq!(again, done);
    }

    #[test]
    fn semantic_issue_becomes_warning_not_error() {
        let (submitting, ticket) = SessionState::new().start_submit();
        let mut interpretation = success("QUJD");
        let result = GenerationResult::from_value(serde_json::json!({
            "status": "needs_input",
            "summary": "The wrist is not visible."
        }));
        assert_eq!(result.status, ResultStatus::NeedsInput);
        interpretation.result = Some(result);

        let done = submitting.complete(ticket, Ok(interpretation));
        assert_eq!(done.phase, Phase::Success);
        assert!(done.error.is_none());
        assert_eq!(done.warning.as_deref(), Some("The wrist is not visible."));
    }

    #[test]
    fn reject_does_not_consume_a_ticket() {
        let (submitting, ticket) = SessionState::new().start_submit();
        let rejected = submitting.reject("Upload a subject photo first.");
        assert_eq!(rejected.phase, Phase::Error);
        let done = rejected.complete(ticket, Ok(success("QUJD")));
        assert_eq!(done, rejected);
    }

    #[test]
    fn loading_messages_rotate() {
        assert_eq!(loading_message(0), LOADING_MESSAGES[0]);
        assert_eq!(loading_message(LOADING_MESSAGES.len() + 1), LOADING_MESSAGES[1]);
    }
}
