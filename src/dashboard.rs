//! Client for the dashboard API: website config, usage counters, leads and
//! admin notifications. Everything except website lookup is best-effort
//! bookkeeping for the chat flow.

use async_trait::async_trait;

use crate::types::{LeadCreate, NotificationCreate, WebsiteConfig};

#[async_trait]
pub trait DashboardApi: Send + Sync {
    async fn fetch_website(&self, website_id: &str) -> Option<WebsiteConfig>;
    async fn increment_usage(&self, website_id: &str, stat: &str) -> Result<(), String>;
    async fn create_lead(&self, lead: &LeadCreate) -> Result<(), String>;
    async fn create_notification(&self, notification: &NotificationCreate) -> Result<(), String>;
}

pub struct HttpDashboardApi {
    client: reqwest::Client,
    base_url: String,
    service_token: Option<String>,
}

impl HttpDashboardApi {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        service_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.service_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn post_json(&self, path: &str, body: &impl serde::Serialize) -> Result<(), String> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|err| format!("dashboard request to {path} failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("dashboard {path} returned {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl DashboardApi for HttpDashboardApi {
    async fn fetch_website(&self, website_id: &str) -> Option<WebsiteConfig> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/websites/{website_id}"),
            )
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            tracing::warn!(website_id, status = %response.status(), "website lookup failed");
            return None;
        }
        response.json::<WebsiteConfig>().await.ok()
    }

    async fn increment_usage(&self, website_id: &str, stat: &str) -> Result<(), String> {
        self.post_json(
            "/api/usage/increment",
            &serde_json::json!({ "websiteId": website_id, "stat": stat }),
        )
        .await
    }

    async fn create_lead(&self, lead: &LeadCreate) -> Result<(), String> {
        self.post_json("/api/leads", lead).await
    }

    async fn create_notification(&self, notification: &NotificationCreate) -> Result<(), String> {
        self.post_json("/api/notifications", notification).await
    }
}
