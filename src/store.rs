//! Conversation and message persistence.
//!
//! `get_or_create` is the single entry point for conversation identity: one
//! row per (website, visitor) pair, created lazily on the first message that
//! passes the conversation limit gate, geolocated once at creation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    dashboard::DashboardApi,
    error::StoreError,
    geo::GeoResolver,
    limits::LimitChecker,
    types::{Conversation, GeoInfo, GetOrCreate, MessageKind, StoredMessage},
};

/// A message starts read unless it is visitor-authored and no admin was
/// connected to the website when it arrived.
pub fn initial_read_flag(kind: MessageKind, admin_online: bool) -> bool {
    admin_online || kind != MessageKind::Visitor
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create(
        &self,
        website_id: &str,
        visitor_id: &str,
        visitor_ip: &str,
    ) -> Result<GetOrCreate, StoreError>;

    async fn save_message(
        &self,
        conversation_id: i64,
        body: &str,
        kind: MessageKind,
        admin_online: bool,
    ) -> Result<StoredMessage, StoreError>;

    /// With ids: marks only those ids, scoped to the conversation. Without:
    /// marks every unread message in the conversation. Logs and returns
    /// false on failure, never errors to the caller.
    async fn mark_read(&self, conversation_id: i64, message_ids: Option<&[i64]>) -> bool;
}

pub struct PgConversationStore {
    pool: PgPool,
    limits: Arc<dyn LimitChecker>,
    geo: Arc<dyn GeoResolver>,
    dashboard: Arc<dyn DashboardApi>,
}

impl PgConversationStore {
    pub fn new(
        pool: PgPool,
        limits: Arc<dyn LimitChecker>,
        geo: Arc<dyn GeoResolver>,
        dashboard: Arc<dyn DashboardApi>,
    ) -> Self {
        Self {
            pool,
            limits,
            geo,
            dashboard,
        }
    }

    async fn find_conversation(
        &self,
        website_id: &str,
        visitor_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, website_id, visitor_id, visitor_ip, country, country_code, continent, \
                    continent_code, as_name, as_domain, created_at, last_message_at \
             FROM conversations WHERE website_id = $1 AND visitor_id = $2",
        )
        .bind(website_id)
        .bind(visitor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_conversation_row))
    }
}

fn parse_conversation_row(row: PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        website_id: row.get("website_id"),
        visitor_id: row.get("visitor_id"),
        visitor_ip: row.get("visitor_ip"),
        geo: GeoInfo {
            country: row.get("country"),
            country_code: row.get("country_code"),
            continent: row.get("continent"),
            continent_code: row.get("continent_code"),
            as_name: row.get("as_name"),
            as_domain: row.get("as_domain"),
        },
        created_at: row.get("created_at"),
        last_message_at: row.get("last_message_at"),
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn get_or_create(
        &self,
        website_id: &str,
        visitor_id: &str,
        visitor_ip: &str,
    ) -> Result<GetOrCreate, StoreError> {
        if let Some(conversation) = self.find_conversation(website_id, visitor_id).await? {
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

        // Concurrent first messages race here; the unique index turns the
        // loser's insert into a no-op and we fall back to a lookup.
        let inserted = sqlx::query(
            "INSERT INTO conversations \
                (website_id, visitor_id, visitor_ip, country, country_code, continent, \
                 continent_code, as_name, as_domain, created_at, last_message_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
             ON CONFLICT (website_id, visitor_id) DO NOTHING \
             RETURNING id",
        )
        .bind(website_id)
        .bind(visitor_id)
        .bind(visitor_ip)
        .bind(&geo.country)
        .bind(&geo.country_code)
        .bind(&geo.continent)
        .bind(&geo.continent_code)
        .bind(&geo.as_name)
        .bind(&geo.as_domain)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = inserted else {
            let conversation = self
                .find_conversation(website_id, visitor_id)
                .await?
                .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
            return Ok(GetOrCreate {
                conversation,
                is_new: false,
            });
        };

        let dashboard = Arc::clone(&self.dashboard);
        let usage_website = website_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = dashboard.increment_usage(&usage_website, "conversations").await {
                tracing::warn!(website_id = %usage_website, error = %err, "conversation usage increment failed");
            }
        });

        Ok(GetOrCreate {
            conversation: Conversation {
                id: row.get("id"),
                website_id: website_id.to_string(),
                visitor_id: visitor_id.to_string(),
                visitor_ip: visitor_ip.to_string(),
                geo,
                created_at: now.clone(),
                last_message_at: now,
            },
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
        let read = initial_read_flag(kind, admin_online);
        let row = sqlx::query(
            "INSERT INTO messages (conversation_id, body, kind, \"read\", created_at) \
             VALUES ($1,$2,$3,$4,$5) RETURNING id",
        )
        .bind(conversation_id)
        .bind(body)
        .bind(kind.as_str())
        .bind(read)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET last_message_at = $1 WHERE id = $2")
            .bind(&now)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(StoredMessage {
            id: row.get("id"),
            conversation_id,
            body: body.to_string(),
            kind,
            read,
            created_at: now,
        })
    }

    async fn mark_read(&self, conversation_id: i64, message_ids: Option<&[i64]>) -> bool {
        let result = match message_ids {
            Some(ids) => {
                sqlx::query(
                    "UPDATE messages SET \"read\" = TRUE \
                     WHERE conversation_id = $1 AND id = ANY($2)",
                )
                .bind(conversation_id)
                .bind(ids)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE messages SET \"read\" = TRUE \
                     WHERE conversation_id = $1 AND \"read\" = FALSE",
                )
                .bind(conversation_id)
                .execute(&self.pool)
                .await
            }
        };
        match result {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(conversation_id, error = %err, "mark_read failed");
                false
            }
        }
    }
}
