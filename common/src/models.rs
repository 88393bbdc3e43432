use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted identity of a (source, cwd, settings) tuple. Rows are written
/// once and never mutated; the fingerprint column is unique.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProxyConfigRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source_path: String,
    pub cwd: String,
    pub config_json: String,
    pub fingerprint: String,
}

/// One captured request/response cycle. `response_status_code == 0` encodes
/// a pending session (the forward has not completed yet).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub config_id: String,
    pub created_at: DateTime<Utc>,

    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,

    pub client_addr: String,
    pub client_ip: String,

    pub request_method: String,
    pub request_path: String,
    pub request_query: String,
    pub request_proto: String,
    pub request_host: String,
    pub request_url_full: String,
    pub request_headers: String,
    pub query_parameters: String,
    #[serde(with = "base64_bytes")]
    pub request_body: Vec<u8>,
    pub request_body_size: i64,
    pub request_content_type: String,
    pub request_content_encoding: String,

    pub response_status_code: i64,
    pub response_status_text: String,
    pub response_headers: String,
    #[serde(with = "base64_bytes")]
    pub response_body: Vec<u8>,
    pub response_body_size: i64,
    pub response_content_type: String,
    pub response_content_encoding: String,
}

impl SessionRow {
    pub fn is_pending(&self) -> bool {
        self.response_status_code == 0
    }

    /// Reduced projection used as the pub/sub payload.
    pub fn stub(&self) -> SessionStub {
        SessionStub {
            id: self.id.clone(),
            config_id: self.config_id.clone(),
            status_code: self.response_status_code,
            method: self.request_method.clone(),
            path: self.request_path.clone(),
            timestamp: self.timestamp,
            duration_ms: self.duration_ms,
        }
    }
}

/// Snapshot copy of a session plus user metadata. Bookmarks survive deletion
/// of their source session; `session_id` is a lookup key, not a foreign key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BookmarkRow {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,

    pub note: String,
    pub tags: String,

    pub config_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub client_addr: String,
    pub client_ip: String,
    pub request_method: String,
    pub request_path: String,
    pub request_query: String,
    pub request_proto: String,
    pub request_host: String,
    pub request_url_full: String,
    pub request_headers: String,
    pub query_parameters: String,
    #[serde(with = "base64_bytes")]
    pub request_body: Vec<u8>,
    pub request_body_size: i64,
    pub request_content_type: String,
    pub request_content_encoding: String,
    pub response_status_code: i64,
    pub response_status_text: String,
    pub response_headers: String,
    #[serde(with = "base64_bytes")]
    pub response_body: Vec<u8>,
    pub response_body_size: i64,
    pub response_content_type: String,
    pub response_content_encoding: String,

    pub config_source_path: String,
    pub config_json: String,
}

/// Key/value row persisting settings across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SystemSettingRow {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Pub/sub projection of a session; the same shape is published when a
/// session opens and when it completes. Subscribers tell the two apart by
/// `status_code != 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStub {
    pub id: String,
    pub config_id: String,
    pub status_code: i64,
    pub method: String,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Everything the hub can carry, serialized with a `type` discriminator at
/// the wire boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    NewSession { session: SessionStub },
    DeleteSession { ids: Vec<String> },
    UpdateSession { bookmark: Box<BookmarkRow> },
}

/// Callback wired from the proxy pipeline and the reaper into the hub.
pub type PublishFn = Arc<dyn Fn(&str, Event) + Send + Sync>;

/// Serialize binary bodies as base64 strings so captured payloads stay
/// JSON-representable regardless of content.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stub() -> SessionStub {
        SessionStub {
            id: "abc123def456".to_string(),
            config_id: "cfg123cfg456".to_string(),
            status_code: 0,
            method: "GET".to_string(),
            path: "/foo".to_string(),
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    #[test]
    fn events_carry_type_discriminator() {
        let v = serde_json::to_value(Event::NewSession {
            session: sample_stub(),
        })
        .unwrap();
        assert_eq!(v["type"], "new_session");
        assert_eq!(v["session"]["path"], "/foo");
        assert_eq!(v["session"]["status_code"], 0);

        let v = serde_json::to_value(Event::DeleteSession {
            ids: vec!["a".into(), "b".into()],
        })
        .unwrap();
        assert_eq!(v["type"], "delete_session");
        assert_eq!(v["ids"].as_array().unwrap().len(), 2);
    }
}
