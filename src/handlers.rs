//! Inbound message handling and room broadcasting.
//!
//! One shared room per website carries everything the visitor may see
//! (`visitor-receive-message`, the limit notice, `limits-exceeded`); the
//! admin-only room carries visitor traffic and lead alerts
//! (`admin-receive-message`, `new-lead`).

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::{
    dedup::InflightRegistry,
    error::StoreError,
    prompting::{build_system_prompt, transcript_from_history},
    sales,
    types::{
        AdminMessageIn, AppState, Conversation, LeadCreate, MarkReadIn, MessageKind,
        NotificationCreate, VisitorMessageIn, WebsiteConfig,
    },
};

pub const CONVERSATION_LIMIT_MESSAGE: &str =
    "This chat is temporarily unavailable because the website has reached its \
     conversation limit. Please try again later.";

pub const AI_FALLBACK_MESSAGE: &str =
    "I'm sorry, I'm having trouble responding right now. Please try again in a \
     moment, or a member of our team will get back to you.";

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

/// Sends to every connection bound to the website, visitors and admins alike.
pub async fn emit_to_website_room<T: Serialize>(
    state: &Arc<AppState>,
    website_id: &str,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        rt.clients
            .iter()
            .filter(|(id, _)| {
                rt.website_by_client.get(*id).map(String::as_str) == Some(website_id)
            })
            .map(|(_, tx)| tx.clone())
            .collect::<Vec<_>>()
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

/// Sends only to admin connections bound to the website.
pub async fn emit_to_admin_room<T: Serialize>(
    state: &Arc<AppState>,
    website_id: &str,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        rt.admins
            .iter()
            .filter(|id| rt.website_by_client.get(*id).map(String::as_str) == Some(website_id))
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

pub async fn admin_online_for_website(state: &Arc<AppState>, website_id: &str) -> bool {
    let rt = state.realtime.lock().await;
    rt.admins.iter().any(|id| {
        rt.website_by_client.get(id).map(String::as_str) == Some(website_id)
            && rt.clients.get(id).is_some_and(|tx| !tx.is_closed())
    })
}

pub async fn handle_admin_message(state: &Arc<AppState>, client_id: usize, msg: AdminMessageIn) {
    let authorized = {
        let rt = state.realtime.lock().await;
        rt.admins.contains(&client_id)
            && rt.website_by_client.get(&client_id).map(String::as_str)
                == Some(msg.website_id.as_str())
    };
    if !authorized {
        tracing::warn!(
            client_id,
            website_id = %msg.website_id,
            "admin message dropped: sender not an admin of this website"
        );
        return;
    }

    // Same get-or-create path as visitor traffic, so an admin can open the
    // very first message of a conversation.
    let resolved = match state
        .store
        .get_or_create(&msg.website_id, &msg.visitor_id, "unknown")
        .await
    {
        Ok(resolved) => resolved,
        Err(StoreError::LimitReached { decision }) => {
            tracing::warn!(
                website_id = %msg.website_id,
                limits = ?decision.limits,
                "admin message blocked by conversation limit"
            );
            emit_limit_notice(state, &msg.website_id, &msg.visitor_id).await;
            return;
        }
        Err(err) => {
            tracing::error!(website_id = %msg.website_id, error = %err, "admin message conversation lookup failed");
            return;
        }
    };

    let saved = match state
        .store
        .save_message(resolved.conversation.id, &msg.message, MessageKind::Admin, true)
        .await
    {
        Ok(saved) => saved,
        Err(err) => {
            tracing::error!(website_id = %msg.website_id, error = %err, "admin message persist failed");
            return;
        }
    };

    emit_to_website_room(
        state,
        &msg.website_id,
        "visitor-receive-message",
        json!({
            "conversationId": saved.conversation_id,
            "websiteId": msg.website_id,
            "visitorId": msg.visitor_id,
            "message": saved.body,
            "type": saved.kind.as_str(),
            "createdAt": saved.created_at,
        }),
    )
    .await;
}

pub async fn handle_visitor_message(
    state: &Arc<AppState>,
    client_id: usize,
    msg: VisitorMessageIn,
) {
    let (bound_website, visitor_ip) = {
        let rt = state.realtime.lock().await;
        (
            rt.website_by_client.get(&client_id).cloned(),
            rt.ip_by_client.get(&client_id).cloned(),
        )
    };
    if bound_website.as_deref() != Some(msg.website_id.as_str()) {
        tracing::warn!(
            client_id,
            website_id = %msg.website_id,
            "visitor message dropped: sender not bound to this website"
        );
        return;
    }
    let visitor_ip = visitor_ip.unwrap_or_else(|| "unknown".to_string());

    let resolved = match state
        .store
        .get_or_create(&msg.website_id, &msg.visitor_id, &visitor_ip)
        .await
    {
        Ok(resolved) => resolved,
        Err(StoreError::LimitReached { decision }) => {
            tracing::info!(
                website_id = %msg.website_id,
                limits = ?decision.limits,
                "conversation rejected: limit reached"
            );
            emit_limit_notice(state, &msg.website_id, &msg.visitor_id).await;
            return;
        }
        Err(err) => {
            tracing::error!(website_id = %msg.website_id, error = %err, "visitor message conversation lookup failed");
            return;
        }
    };

    let admin_online = admin_online_for_website(state, &msg.website_id).await;
    let saved = match state
        .store
        .save_message(
            resolved.conversation.id,
            &msg.message,
            MessageKind::Visitor,
            admin_online,
        )
        .await
    {
        Ok(saved) => saved,
        Err(err) => {
            tracing::error!(website_id = %msg.website_id, error = %err, "visitor message persist failed");
            return;
        }
    };

    let geo = &resolved.conversation.geo;
    emit_to_admin_room(
        state,
        &msg.website_id,
        "admin-receive-message",
        json!({
            "conversationId": saved.conversation_id,
            "websiteId": msg.website_id,
            "visitorId": msg.visitor_id,
            "message": saved.body,
            "type": saved.kind.as_str(),
            "read": saved.read,
            "createdAt": saved.created_at,
            "country": geo.country,
            "countryCode": geo.country_code,
            "continent": geo.continent,
            "continentCode": geo.continent_code,
            "asName": geo.as_name,
            "asDomain": geo.as_domain,
            "isNewConversation": resolved.is_new,
        }),
    )
    .await;

    let Some(website) = state.dashboard.fetch_website(&msg.website_id).await else {
        tracing::warn!(website_id = %msg.website_id, "website lookup failed, skipping AI step");
        return;
    };
    if !website.ai_enabled {
        return;
    }

    let state = Arc::clone(state);
    let conversation = resolved.conversation;
    tokio::spawn(async move {
        run_ai_pipeline(state, conversation, website, msg).await;
    });
}

async fn emit_limit_notice(state: &Arc<AppState>, website_id: &str, visitor_id: &str) {
    emit_to_website_room(
        state,
        website_id,
        "visitor-receive-message",
        json!({
            "websiteId": website_id,
            "visitorId": visitor_id,
            "message": CONVERSATION_LIMIT_MESSAGE,
            "type": MessageKind::System.as_str(),
            "createdAt": now_iso(),
        }),
    )
    .await;
}

pub async fn run_ai_pipeline(
    state: Arc<AppState>,
    conversation: Conversation,
    website: WebsiteConfig,
    msg: VisitorMessageIn,
) {
    let key = InflightRegistry::key(&msg.website_id, &msg.visitor_id, &msg.message, now_secs());
    run_ai_pipeline_keyed(state, conversation, website, msg, key).await;
}

/// Pipeline body with the dedup key supplied by the caller.
pub async fn run_ai_pipeline_keyed(
    state: Arc<AppState>,
    conversation: Conversation,
    website: WebsiteConfig,
    msg: VisitorMessageIn,
    key: String,
) {
    {
        let mut inflight = state.inflight.lock().await;
        if !inflight.begin(&key) {
            tracing::info!(website_id = %msg.website_id, "duplicate AI request skipped");
            return;
        }
    }

    let decision = state.limits.check_ai_response(&msg.website_id).await;
    if !decision.eligible {
        // Deliberately invisible to the visitor: a human admin can step in
        // without the widget ever showing a refused AI reply.
        tracing::info!(website_id = %msg.website_id, "AI reply suppressed: limit reached");
        emit_to_website_room(
            &state,
            &msg.website_id,
            "limits-exceeded",
            json!({
                "websiteId": msg.website_id,
                "reason": "ai-response-limit",
                "silent": true,
                "limits": decision.limits,
            }),
        )
        .await;
        state.inflight.lock().await.finish(&key);
        return;
    }

    let transcript = transcript_from_history(&msg.messages);
    let system_prompt = build_system_prompt(&website, msg.messages.is_empty(), &msg.message);
    let (reply, generation_failed) = match state
        .responder
        .generate(&system_prompt, &transcript, &msg.message)
        .await
    {
        Ok(text) => (text, false),
        Err(err) => {
            tracing::warn!(website_id = %msg.website_id, error = %err, "AI generation failed, sending fallback reply");
            (AI_FALLBACK_MESSAGE.to_string(), true)
        }
    };

    let saved = match state
        .store
        .save_message(conversation.id, &reply, MessageKind::Ai, true)
        .await
    {
        Ok(saved) => saved,
        Err(err) => {
            tracing::error!(website_id = %msg.website_id, error = %err, "AI reply persist failed");
            state.inflight.lock().await.finish(&key);
            return;
        }
    };

    if !generation_failed {
        // Counter only moves once the reply row exists, and never for the
        // fallback apology.
        if let Err(err) = state
            .dashboard
            .increment_usage(&msg.website_id, "aiResponses")
            .await
        {
            tracing::warn!(website_id = %msg.website_id, error = %err, "AI usage increment failed");
        }

        capture_lead(&state, &conversation, &website, &msg, &reply, &transcript).await;
    }

    emit_to_website_room(
        &state,
        &msg.website_id,
        "visitor-receive-message",
        json!({
            "conversationId": saved.conversation_id,
            "websiteId": msg.website_id,
            "visitorId": msg.visitor_id,
            "message": saved.body,
            "type": saved.kind.as_str(),
            "createdAt": saved.created_at,
        }),
    )
    .await;

    state.inflight.lock().await.finish(&key);
}

/// Best-effort purchase-intent scan. Nothing in here may disturb reply
/// delivery; every failure is logged and dropped.
async fn capture_lead(
    state: &Arc<AppState>,
    conversation: &Conversation,
    website: &WebsiteConfig,
    msg: &VisitorMessageIn,
    reply: &str,
    transcript: &str,
) {
    let Some(analysis) = state.sales.analyze(&msg.message, reply, transcript).await else {
        return;
    };
    if !sales::qualifies(&analysis) {
        return;
    }
    let Some(email) = sales::extract_email(&msg.message) else {
        return;
    };

    let lead = LeadCreate {
        website_id: msg.website_id.clone(),
        conversation_id: conversation.id,
        email: email.clone(),
        product_mentioned: analysis.product_mentioned.clone(),
        estimated_value: analysis.estimated_value,
        confidence_score: analysis.confidence_score,
        source: "chat".to_string(),
    };
    if let Err(err) = state.dashboard.create_lead(&lead).await {
        tracing::warn!(website_id = %msg.website_id, error = %err, "lead creation failed");
    }

    emit_to_admin_room(
        state,
        &msg.website_id,
        "new-lead",
        json!({
            "websiteId": msg.website_id,
            "conversationId": conversation.id,
            "email": email,
            "productMentioned": analysis.product_mentioned,
            "estimatedValue": analysis.estimated_value,
            "confidenceScore": analysis.confidence_score,
        }),
    )
    .await;

    let notification = NotificationCreate {
        user_id: website.user_id.clone(),
        website_id: msg.website_id.clone(),
        title: "Potential sale detected".to_string(),
        body: format!("A visitor ({email}) showed purchase intent in chat."),
        priority: "high".to_string(),
    };
    if let Err(err) = state.dashboard.create_notification(&notification).await {
        tracing::warn!(website_id = %msg.website_id, error = %err, "sale notification failed");
    }
}

pub async fn handle_mark_read(state: &Arc<AppState>, client_id: usize, msg: MarkReadIn) {
    let is_admin = {
        let rt = state.realtime.lock().await;
        rt.admins.contains(&client_id)
    };
    if !is_admin {
        tracing::warn!(client_id, "mark-read dropped: sender is not an admin");
        return;
    }
    state
        .store
        .mark_read(msg.conversation_id, msg.message_ids.as_deref())
        .await;
}
