//! Capability boundary to the generative-model service. Consumed by the
//! client send pipeline (moderation gate) and the server assist endpoints;
//! never implemented against a live model in this workspace.

use async_trait::async_trait;

use crate::error::{ApiException, ErrorCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationOutcome {
    pub approved: bool,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String, ApiException>;
    async fn draft_reply(&self, last_message_text: &str) -> Result<Vec<String>, ApiException>;
    async fn moderate(&self, text: &str) -> Result<ModerationOutcome, ApiException>;
}

/// Deterministic fallback used whenever no model credential is configured.
/// Callers must never fail just because the credential is absent.
pub struct StubAssistant;

const STUB_BLOCKLIST: &[&str] = &["<blocked>", "[spam]"];

#[async_trait]
impl Assistant for StubAssistant {
    async fn summarize(&self, transcript: &str) -> Result<String, ApiException> {
        let lines = transcript.lines().filter(|l| !l.trim().is_empty()).count();
        Ok(format!("Summary unavailable offline ({lines} messages reviewed)."))
    }

    async fn draft_reply(&self, last_message_text: &str) -> Result<Vec<String>, ApiException> {
        if last_message_text.trim().is_empty() {
            return Err(ApiException::new(
                ErrorCode::Validation,
                "cannot draft a reply to an empty message",
            ));
        }
        Ok(vec![
            "Sounds good!".to_string(),
            "Thanks for the update.".to_string(),
            "Can we talk about this later?".to_string(),
        ])
    }

    async fn moderate(&self, text: &str) -> Result<ModerationOutcome, ApiException> {
        let lowered = text.to_lowercase();
        for marker in STUB_BLOCKLIST {
            if lowered.contains(marker) {
                return Ok(ModerationOutcome {
                    approved: false,
                    reason: Some(format!("contains disallowed marker {marker}")),
                });
            }
        }
        Ok(ModerationOutcome {
            approved: true,
            reason: None,
        })
    }
}
