//! Tenant connection records and the stores that persist them.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod store;

pub use store::{ConnectionStore, InMemoryConnectionStore, JsonFileConnectionStore, StoreError};

/// One configured tenant: where its CRM lives and how to reach its gateway.
///
/// Workers carry a clone of this as a read-only snapshot; the store owns the
/// authoritative copy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub id: u64,
    pub client_id: String,
    /// CRM system url, the one activity events report.
    pub system_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub gate_url: String,
    #[serde(default)]
    pub gate_token: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(client_id: impl Into<String>, system_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            client_id: client_id.into(),
            system_url: system_url.into(),
            api_key: String::new(),
            gate_url: String::new(),
            gate_token: String::new(),
            active: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_gateway(mut self, gate_url: impl Into<String>, gate_token: impl Into<String>) -> Self {
        self.gate_url = gate_url.into();
        self.gate_token = gate_token.into();
        self
    }

    pub fn activated(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

// keys and tokens never end up in logs
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("system_url", &self.system_url)
            .field("api_key", &redact(&self.api_key))
            .field("gate_url", &self.gate_url)
            .field("gate_token", &redact(&self.gate_token))
            .field("active", &self.active)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() { "<empty>" } else { "<redacted>" }
}
