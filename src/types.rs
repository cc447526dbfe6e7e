use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::AtomicUsize, Arc},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::{
    ai::{AiResponder, SaleAnalyzer},
    dashboard::DashboardApi,
    dedup::InflightRegistry,
    limits::LimitChecker,
    store::ConversationStore,
};

/// Author of a chat message. Stored as lowercase text in the messages table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Visitor,
    Admin,
    Ai,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Visitor => "visitor",
            MessageKind::Admin => "admin",
            MessageKind::Ai => "ai",
            MessageKind::System => "system",
        }
    }

    pub fn from_db(value: &str) -> MessageKind {
        match value {
            "admin" => MessageKind::Admin,
            "ai" => MessageKind::Ai,
            "system" => MessageKind::System,
            _ => MessageKind::Visitor,
        }
    }
}

/// IP-derived location metadata, captured once when a conversation is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoInfo {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub continent: String,
    #[serde(default)]
    pub continent_code: String,
    #[serde(default)]
    pub as_name: String,
    #[serde(default)]
    pub as_domain: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub website_id: String,
    pub visitor_id: String,
    pub visitor_ip: String,
    #[serde(flatten)]
    pub geo: GeoInfo,
    pub created_at: String,
    pub last_message_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub body: String,
    pub kind: MessageKind,
    pub read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct GetOrCreate {
    pub conversation: Conversation,
    pub is_new: bool,
}

/// Whether exceeding this limit is surfaced to the visitor or kept internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disclosure {
    Visible,
    Silent,
}

#[derive(Debug, Clone)]
pub struct LimitDecision {
    pub eligible: bool,
    pub limits: Option<Value>,
    pub error: Option<String>,
    pub disclosure: Disclosure,
}

impl LimitDecision {
    pub fn eligible(disclosure: Disclosure) -> Self {
        Self {
            eligible: true,
            limits: None,
            error: None,
            disclosure,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleAnalysis {
    #[serde(default)]
    pub has_potential_sale: bool,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub product_mentioned: Option<String>,
    #[serde(default)]
    pub estimated_value: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub custom_instructions: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteConfig {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ai_enabled: bool,
    #[serde(default)]
    pub business_description: String,
    #[serde(default)]
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadCreate {
    pub website_id: String,
    pub conversation_id: i64,
    pub email: String,
    pub product_mentioned: Option<String>,
    pub estimated_value: Option<f64>,
    pub confidence_score: f64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCreate {
    pub user_id: String,
    pub website_id: String,
    pub title: String,
    pub body: String,
    pub priority: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminMessageIn {
    pub website_id: String,
    pub visitor_id: String,
    pub message: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorMessageIn {
    pub website_id: String,
    pub visitor_id: String,
    pub message: String,
    #[serde(default)]
    pub messages: Vec<HistoryTurn>,
}

/// One prior turn of the widget-side transcript, replayed by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTurn {
    #[serde(default)]
    pub sender: String,
    #[serde(default, alias = "message")]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadIn {
    pub conversation_id: i64,
    #[serde(default)]
    pub message_ids: Option<Vec<i64>>,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub admins: HashSet<usize>,
    pub website_by_client: HashMap<usize, String>,
    pub visitor_by_client: HashMap<usize, String>,
    pub ip_by_client: HashMap<usize, String>,
}

pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub limits: Arc<dyn LimitChecker>,
    pub responder: Arc<dyn AiResponder>,
    pub sales: Arc<dyn SaleAnalyzer>,
    pub dashboard: Arc<dyn DashboardApi>,
    pub realtime: Mutex<RealtimeState>,
    pub inflight: Mutex<InflightRegistry>,
    pub next_client_id: AtomicUsize,
}
