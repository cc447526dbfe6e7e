//! Shared test doubles: an in-memory conversation store honoring the
//! production contract, plus scriptable fakes for every external capability.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    ai::{AiResponder, SaleAnalyzer},
    dashboard::DashboardApi,
    dedup::InflightRegistry,
    error::StoreError,
    geo::GeoResolver,
    limits::LimitChecker,
    store::{initial_read_flag, ConversationStore},
    types::{
        AppState, Conversation, Disclosure, GeoInfo, GetOrCreate, LeadCreate, LimitDecision,
        MessageKind, NotificationCreate, RealtimeState, SaleAnalysis, StoredMessage,
        VisitorMessageIn, WebsiteConfig,
    },
};

pub struct FakeLimitChecker {
    conversation_eligible: AtomicBool,
    ai_eligible: AtomicBool,
}

impl FakeLimitChecker {
    pub fn new() -> Self {
        Self {
            conversation_eligible: AtomicBool::new(true),
            ai_eligible: AtomicBool::new(true),
        }
    }

    pub fn set_conversation_eligible(&self, eligible: bool) {
        self.conversation_eligible.store(eligible, Ordering::SeqCst);
    }

    pub fn set_ai_eligible(&self, eligible: bool) {
        self.ai_eligible.store(eligible, Ordering::SeqCst);
    }

    fn decision(&self, eligible: bool, disclosure: Disclosure) -> LimitDecision {
        LimitDecision {
            eligible,
            limits: if eligible {
                None
            } else {
                Some(serde_json::json!({ "used": 50, "max": 50 }))
            },
            error: None,
            disclosure,
        }
    }
}

#[async_trait]
impl LimitChecker for FakeLimitChecker {
    async fn check_conversation(&self, _website_id: &str) -> LimitDecision {
        self.decision(
            self.conversation_eligible.load(Ordering::SeqCst),
            Disclosure::Visible,
        )
    }

    async fn check_ai_response(&self, _website_id: &str) -> LimitDecision {
        self.decision(self.ai_eligible.load(Ordering::SeqCst), Disclosure::Silent)
    }
}

pub struct FakeGeo {
    calls: AtomicUsize,
    info: GeoInfo,
}

impl FakeGeo {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            info: GeoInfo {
                country: "Portugal".to_string(),
                country_code: "PT".to_string(),
                continent: "Europe".to_string(),
                continent_code: "EU".to_string(),
                as_name: "Example Telecom".to_string(),
                as_domain: "example.net".to_string(),
            },
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> GeoInfo {
        self.info.clone()
    }
}

#[async_trait]
impl GeoResolver for FakeGeo {
    async fn resolve(&self, _ip: &str) -> GeoInfo {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.info.clone()
    }
}

pub struct FakeResponder {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay_ms: AtomicU64,
    last_system_prompt: Mutex<Option<String>>,
}

impl FakeResponder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            last_system_prompt: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay_ms(&self, delay: u64) {
        self.delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn last_system_prompt(&self) -> Option<String> {
        self.last_system_prompt.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiResponder for FakeResponder {
    async fn generate(
        &self,
        system_prompt: &str,
        _transcript: &str,
        _visitor_text: &str,
    ) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_system_prompt.lock().unwrap() = Some(system_prompt.to_string());
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err("provider unavailable".to_string());
        }
        Ok("Thanks for reaching out! How can I help?".to_string())
    }
}

pub struct FakeSales {
    analysis: Mutex<Option<SaleAnalysis>>,
}

impl FakeSales {
    pub fn new() -> Self {
        Self {
            analysis: Mutex::new(None),
        }
    }

    pub fn set_analysis(&self, analysis: Option<SaleAnalysis>) {
        *self.analysis.lock().unwrap() = analysis;
    }
}

#[async_trait]
impl SaleAnalyzer for FakeSales {
    async fn analyze(&self, _: &str, _: &str, _: &str) -> Option<SaleAnalysis> {
        self.analysis.lock().unwrap().clone()
    }
}

pub struct FakeDashboard {
    website: Mutex<Option<WebsiteConfig>>,
    usage: Mutex<Vec<(String, String)>>,
    leads: Mutex<Vec<LeadCreate>>,
    notifications: Mutex<Vec<NotificationCreate>>,
    fail_leads: AtomicBool,
    fail_notifications: AtomicBool,
}

impl FakeDashboard {
    pub fn new() -> Self {
        Self {
            website: Mutex::new(None),
            usage: Mutex::new(Vec::new()),
            leads: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            fail_leads: AtomicBool::new(false),
            fail_notifications: AtomicBool::new(false),
        }
    }

    pub fn set_website(&self, website: Option<WebsiteConfig>) {
        *self.website.lock().unwrap() = website;
    }

    pub fn usage_count(&self, stat: &str) -> usize {
        self.usage
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s == stat)
            .count()
    }

    pub fn leads(&self) -> Vec<LeadCreate> {
        self.leads.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<NotificationCreate> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn set_fail_leads(&self, fail: bool) {
        self.fail_leads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DashboardApi for FakeDashboard {
    async fn fetch_website(&self, _website_id: &str) -> Option<WebsiteConfig> {
        self.website.lock().unwrap().clone()
    }

    async fn increment_usage(&self, website_id: &str, stat: &str) -> Result<(), String> {
        self.usage
            .lock()
            .unwrap()
            .push((website_id.to_string(), stat.to_string()));
        Ok(())
    }

    async fn create_lead(&self, lead: &LeadCreate) -> Result<(), String> {
        if self.fail_leads.load(Ordering::SeqCst) {
            return Err("lead endpoint down".to_string());
        }
        self.leads.lock().unwrap().push(lead.clone());
        Ok(())
    }

    async fn create_notification(&self, notification: &NotificationCreate) -> Result<(), String> {
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err("notification endpoint down".to_string());
        }
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MemInner {
    conversations: Vec<Conversation>,
    messages: Vec<StoredMessage>,
    next_conversation_id: i64,
    next_message_id: i64,
}

/// In-memory store following the same flow as the Postgres one: lookup,
/// limit gate, geolocation, insert, best-effort usage increment.
pub struct MemoryConversationStore {
    limits: Arc<dyn LimitChecker>,
    geo: Arc<dyn GeoResolver>,
    dashboard: Arc<dyn DashboardApi>,
    inner: Mutex<MemInner>,
}

impl MemoryConversationStore {
    pub fn new(
        limits: Arc<dyn LimitChecker>,
        geo: Arc<dyn GeoResolver>,
        dashboard: Arc<dyn DashboardApi>,
    ) -> Self {
        Self {
            limits,
            geo,
            dashboard,
            inner: Mutex::new(MemInner::default()),
        }
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().unwrap().conversations.clone()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.inner.lock().unwrap().messages.clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get_or_create(
        &self,
        website_id: &str,
        visitor_id: &str,
        visitor_ip: &str,
    ) -> Result<GetOrCreate, StoreError> {
        let existing = {
            let inner = self.inner.lock().unwrap();
            inner
                .conversations
                .iter()
                .find(|c| c.website_id == website_id && c.visitor_id == visitor_id)
                .cloned()
        };
        if let Some(conversation) = existing {
            return Ok(GetOrCreate {
                conversation,
                is_new: false,
            });
        }

        let decision = self.limits.check_conversation(website_id).await;
        if !decision.eligible {
            return Err(StoreError::LimitReached { decision });
        }

        let geo = self.geo.resolve(visitor_ip).await;
        let now = Utc::now().to_rfc3339();
        let conversation = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_conversation_id += 1;
            let conversation = Conversation {
                id: inner.next_conversation_id,
                website_id: website_id.to_string(),
                visitor_id: visitor_id.to_string(),
                visitor_ip: visitor_ip.to_string(),
                geo,
                created_at: now.clone(),
                last_message_at: now,
            };
            inner.conversations.push(conversation.clone());
            conversation
        };

        let _ = self.dashboard.increment_usage(website_id, "conversations").await;

        Ok(GetOrCreate {
            conversation,
            is_new: true,
        })
    }

    async fn save_message(
        &self,
        conversation_id: i64,
        body: &str,
        kind: MessageKind,
        admin_online: bool,
    ) -> Result<StoredMessage, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut inner = self.inner.lock().unwrap();
        inner.next_message_id += 1;
        let message = StoredMessage {
            id: inner.next_message_id,
            conversation_id,
            body: body.to_string(),
            kind,
            read: initial_read_flag(kind, admin_online),
            created_at: now.clone(),
        };
        inner.messages.push(message.clone());
        if let Some(conversation) = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.last_message_at = now;
        }
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: i64, message_ids: Option<&[i64]>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for message in inner.messages.iter_mut() {
            if message.conversation_id != conversation_id {
                continue;
            }
            match message_ids {
                Some(ids) if !ids.contains(&message.id) => {}
                _ => message.read = true,
            }
        }
        true
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryConversationStore>,
    pub limits: Arc<FakeLimitChecker>,
    pub geo: Arc<FakeGeo>,
    pub responder: Arc<FakeResponder>,
    pub sales: Arc<FakeSales>,
    pub dashboard: Arc<FakeDashboard>,
}

impl Harness {
    pub fn new() -> Self {
        let limits = Arc::new(FakeLimitChecker::new());
        let geo = Arc::new(FakeGeo::new());
        let responder = Arc::new(FakeResponder::new());
        let sales = Arc::new(FakeSales::new());
        let dashboard = Arc::new(FakeDashboard::new());
        let store = Arc::new(MemoryConversationStore::new(
            limits.clone(),
            geo.clone(),
            dashboard.clone(),
        ));
        let state = Arc::new(AppState {
            store: store.clone(),
            limits: limits.clone(),
            responder: responder.clone(),
            sales: sales.clone(),
            dashboard: dashboard.clone(),
            realtime: tokio::sync::Mutex::new(RealtimeState::default()),
            inflight: tokio::sync::Mutex::new(InflightRegistry::new()),
            next_client_id: AtomicUsize::new(0),
        });
        Self {
            state,
            store,
            limits,
            geo,
            responder,
            sales,
            dashboard,
        }
    }

    /// Registers a fake connection bound to `website_id` and returns its id
    /// plus the receiving end of its outbound channel.
    pub async fn connect(
        &self,
        website_id: &str,
        admin: bool,
    ) -> (usize, UnboundedReceiver<String>) {
        let client_id = self.state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut rt = self.state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
        rt.website_by_client
            .insert(client_id, website_id.to_string());
        rt.ip_by_client
            .insert(client_id, "203.0.113.7".to_string());
        if admin {
            rt.admins.insert(client_id);
        }
        (client_id, rx)
    }

    pub fn website(&self, website_id: &str) -> WebsiteConfig {
        WebsiteConfig {
            id: website_id.to_string(),
            user_id: "user-1".to_string(),
            name: "Acme Plants".to_string(),
            ai_enabled: true,
            business_description: "We sell rare houseplants and ship worldwide.".to_string(),
            agent: None,
        }
    }

    pub async fn seed_conversation(&self, website_id: &str, visitor_id: &str) -> Conversation {
        self.store
            .get_or_create(website_id, visitor_id, "203.0.113.7")
            .await
            .expect("seed conversation")
            .conversation
    }
}

pub fn visitor_msg(website_id: &str, visitor_id: &str, text: &str) -> VisitorMessageIn {
    VisitorMessageIn {
        website_id: website_id.to_string(),
        visitor_id: visitor_id.to_string(),
        message: text.to_string(),
        messages: Vec::new(),
    }
}

/// Drains every event already delivered to a fake client, parsed as JSON.
pub fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        if let Ok(value) = serde_json::from_str::<Value>(&payload) {
            events.push(value);
        }
    }
    events
}
