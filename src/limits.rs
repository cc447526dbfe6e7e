//! Subscription limit checks.
//!
//! Two eligibility questions are asked of the dashboard API: may this website
//! open one more conversation, and may it receive one more AI reply. Both are
//! routed through the [`FailOpen`] decorator in production, so a degraded
//! limits backend never takes chat down with it.

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{Disclosure, LimitDecision};

pub const LIMITS_UNAVAILABLE: &str = "Limits check unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitCheckKind {
    Conversation,
    AiResponse,
}

impl LimitCheckKind {
    /// The conversation cap is disclosed to the visitor; the AI cap is kept
    /// internal so a human admin can take over unannounced.
    pub fn disclosure(&self) -> Disclosure {
        match self {
            LimitCheckKind::Conversation => Disclosure::Visible,
            LimitCheckKind::AiResponse => Disclosure::Silent,
        }
    }

    fn path(&self) -> &'static str {
        match self {
            LimitCheckKind::Conversation => "/api/limits/conversations",
            LimitCheckKind::AiResponse => "/api/limits/ai-responses",
        }
    }
}

/// A limit check that may fail outright (transport error, bad payload).
#[async_trait]
pub trait RawLimitChecker: Send + Sync {
    async fn check(&self, website_id: &str, kind: LimitCheckKind) -> Result<LimitDecision, String>;
}

/// The capability the rest of the server programs against. Implementations
/// always produce a decision; how failures degrade is up to the impl.
#[async_trait]
pub trait LimitChecker: Send + Sync {
    async fn check_conversation(&self, website_id: &str) -> LimitDecision;
    async fn check_ai_response(&self, website_id: &str) -> LimitDecision;
}

/// Decorator mapping any raw-checker failure to an eligible decision, with
/// the failure preserved in `error` for logging.
pub struct FailOpen<C> {
    inner: C,
}

impl<C> FailOpen<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: RawLimitChecker> FailOpen<C> {
    async fn check(&self, website_id: &str, kind: LimitCheckKind) -> LimitDecision {
        match self.inner.check(website_id, kind).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(website_id, ?kind, error = %err, "limits check degraded, failing open");
                LimitDecision {
                    eligible: true,
                    limits: None,
                    error: Some(LIMITS_UNAVAILABLE.to_string()),
                    disclosure: kind.disclosure(),
                }
            }
        }
    }
}

#[async_trait]
impl<C: RawLimitChecker> LimitChecker for FailOpen<C> {
    async fn check_conversation(&self, website_id: &str) -> LimitDecision {
        self.check(website_id, LimitCheckKind::Conversation).await
    }

    async fn check_ai_response(&self, website_id: &str) -> LimitDecision {
        self.check(website_id, LimitCheckKind::AiResponse).await
    }
}

/// Raw checker backed by the dashboard API.
pub struct HttpLimitChecker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLimitChecker {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RawLimitChecker for HttpLimitChecker {
    async fn check(&self, website_id: &str, kind: LimitCheckKind) -> Result<LimitDecision, String> {
        let url = format!("{}{}", self.base_url, kind.path());
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "websiteId": website_id }))
            .send()
            .await
            .map_err(|err| format!("limits request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("limits endpoint returned {}", response.status()));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("limits response parse failed: {err}"))?;
        let eligible = payload
            .get("eligible")
            .and_then(Value::as_bool)
            .ok_or_else(|| "limits response missing eligible flag".to_string())?;
        Ok(LimitDecision {
            eligible,
            limits: payload.get("limits").cloned(),
            error: None,
            disclosure: kind.disclosure(),
        })
    }
}
