//! Activity events: the CRM telling us a tenant was switched on, off, frozen
//! or moved to another system url.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActivityError {
    #[error("clientId is missing")]
    MissingClientId,
    #[error("systemUrl `{url}` is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("activity payload is malformed: {0}")]
    MalformedActivity(String),
}

/// What the CRM wants for one tenant right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub client_id: String,
    pub active: bool,
    pub freeze: bool,
    pub system_url: String,
}

impl ActivityEvent {
    pub fn new(client_id: impl Into<String>, active: bool, freeze: bool, system_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            active,
            freeze,
            system_url: system_url.into(),
        }
    }

    /// A frozen tenant never runs, whatever `active` says.
    pub fn should_run(&self) -> bool {
        self.active && !self.freeze
    }

    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.client_id.trim().is_empty() {
            return Err(ActivityError::MissingClientId);
        }
        let invalid = |reason: String| ActivityError::InvalidUrl {
            url: self.system_url.clone(),
            reason,
        };
        let url = Url::parse(&self.system_url).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("unsupported scheme `{other}`"))),
        }
        if url.host_str().is_none() {
            return Err(invalid("no host".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ActivityFlags {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    freeze: bool,
}

/// Form body the CRM posts to `/actions/activity`; `activity` is itself a
/// JSON document like `{"active": true, "freeze": false}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActivityForm {
    #[serde(rename = "clientId", default)]
    pub client_id: String,
    #[serde(default)]
    pub activity: String,
    #[serde(rename = "systemUrl", default)]
    pub system_url: String,
}

impl TryFrom<ActivityForm> for ActivityEvent {
    type Error = ActivityError;

    fn try_from(form: ActivityForm) -> Result<Self, Self::Error> {
        let flags: ActivityFlags = serde_json::from_str(&form.activity)
            .map_err(|e| ActivityError::MalformedActivity(e.to_string()))?;
        let event = ActivityEvent::new(
            form.client_id.trim(),
            flags.active,
            flags.freeze,
            form.system_url.trim(),
        );
        event.validate()?;
        Ok(event)
    }
}
