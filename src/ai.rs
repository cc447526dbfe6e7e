//! Generative-text provider wrappers: the chat responder and the sale
//! analyzer both ride the same chat-completions endpoint.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::SaleAnalysis;

#[async_trait]
pub trait AiResponder: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        transcript: &str,
        visitor_text: &str,
    ) -> Result<String, String>;
}

#[async_trait]
pub trait SaleAnalyzer: Send + Sync {
    /// Best-effort purchase-intent scan of one message pair. Any failure is
    /// swallowed into `None`; the chat flow never depends on this.
    async fn analyze(
        &self,
        visitor_text: &str,
        reply: &str,
        transcript: &str,
    ) -> Option<SaleAnalysis>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    model: String,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    async fn chat_completion_text(&self, system: &str, user: &str) -> Result<String, String> {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err("OPENAI_API_KEY not configured".to_string());
        }
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0.4
            }))
            .send()
            .await
            .map_err(|err| format!("openai request failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("openai returned {status}: {body}"));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("openai parse failed: {err}"))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err("openai response had empty content".to_string());
        }
        Ok(text)
    }
}

#[async_trait]
impl AiResponder for OpenAiClient {
    async fn generate(
        &self,
        system_prompt: &str,
        transcript: &str,
        visitor_text: &str,
    ) -> Result<String, String> {
        let user_content = if transcript.trim().is_empty() {
            format!("Visitor: {}", visitor_text.trim())
        } else {
            format!(
                "Conversation so far:\n{}\n\nVisitor: {}",
                transcript.trim(),
                visitor_text.trim()
            )
        };
        self.chat_completion_text(system_prompt, &user_content).await
    }
}

const SALE_ANALYSIS_SYSTEM: &str = "You analyze one customer-support exchange for purchase intent. \
Respond with strict JSON only, no prose, in this shape: \
{\"hasPotentialSale\": bool, \"confidenceScore\": number between 0 and 1, \
\"productMentioned\": string or null, \"estimatedValue\": number or null}";

#[async_trait]
impl SaleAnalyzer for OpenAiClient {
    async fn analyze(
        &self,
        visitor_text: &str,
        reply: &str,
        transcript: &str,
    ) -> Option<SaleAnalysis> {
        let user_content = format!(
            "Conversation so far:\n{}\n\nVisitor: {}\nAssistant: {}",
            transcript.trim(),
            visitor_text.trim(),
            reply.trim()
        );
        match self
            .chat_completion_text(SALE_ANALYSIS_SYSTEM, &user_content)
            .await
        {
            Ok(raw) => parse_sale_analysis(&raw),
            Err(err) => {
                tracing::warn!(error = %err, "sale analysis request failed");
                None
            }
        }
    }
}

/// Tolerates fenced or prose-wrapped JSON; models do not always follow the
/// strict-JSON instruction.
pub fn parse_sale_analysis(raw: &str) -> Option<SaleAnalysis> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<SaleAnalysis>(&raw[start..=end]).ok()
}
