//! Best-effort IP geolocation for new conversations.

use async_trait::async_trait;
use serde_json::Value;

use crate::types::GeoInfo;

#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Never fails: lookup problems degrade to empty fields so conversation
    /// creation is not blocked on a geolocation outage.
    async fn resolve(&self, ip: &str) -> GeoInfo;
}

pub struct HttpGeoResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGeoResolver {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn lookup(&self, ip: &str) -> Result<GeoInfo, String> {
        let url = format!("{}/{}", self.base_url, ip);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("geo request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("geo endpoint returned {}", response.status()));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("geo response parse failed: {err}"))?;
        Ok(parse_geo_payload(&payload))
    }
}

#[async_trait]
impl GeoResolver for HttpGeoResolver {
    async fn resolve(&self, ip: &str) -> GeoInfo {
        if !is_lookupable(ip) {
            return GeoInfo::default();
        }
        match self.lookup(ip).await {
            Ok(geo) => geo,
            Err(err) => {
                tracing::warn!(ip, error = %err, "geolocation lookup failed");
                GeoInfo::default()
            }
        }
    }
}

/// Private and placeholder addresses are never worth a lookup.
fn is_lookupable(ip: &str) -> bool {
    let ip = ip.trim();
    !(ip.is_empty()
        || ip == "unknown"
        || ip == "127.0.0.1"
        || ip == "::1"
        || ip.starts_with("10.")
        || ip.starts_with("192.168.")
        || ip.starts_with("172.16."))
}

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cursor = payload;
    for key in path {
        cursor = cursor.get(key)?;
    }
    cursor.as_str()
}

fn field(payload: &Value, nested: &[&str], flat: &str) -> String {
    lookup(payload, nested)
        .or_else(|| payload.get(flat).and_then(Value::as_str))
        .unwrap_or("")
        .to_string()
}

fn parse_geo_payload(payload: &Value) -> GeoInfo {
    GeoInfo {
        country: field(payload, &["location", "country"], "country"),
        country_code: field(payload, &["location", "country_code"], "country_code"),
        continent: field(payload, &["location", "continent"], "continent"),
        continent_code: field(payload, &["location", "continent_code"], "continent_code"),
        as_name: field(payload, &["asn", "org"], "as_name"),
        as_domain: field(payload, &["asn", "domain"], "as_domain"),
    }
}
