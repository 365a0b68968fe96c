use serde::{Deserialize, Serialize};

use super::{IngestError, ResultIngestor};
use crate::incident::{normalize_cookies, SessionRefresh, StorageSnapshot};

/// Cookie and storage capture pushed by an agent for one incident.
#[derive(Debug, Default, Deserialize)]
pub struct CookieSync {
    pub cookies: Option<Vec<serde_json::Value>>,
    /// Used to fill in cookies reported without a domain.
    pub host: Option<String>,
    #[serde(alias = "localStorage")]
    pub local_storage: Option<serde_json::Value>,
    #[serde(alias = "sessionStorage")]
    pub session_storage: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CookieSyncReport {
    pub success: bool,
    pub incident_id: String,
    pub cookies_updated: usize,
    pub cookies_skipped: usize,
}

impl ResultIngestor {
    pub fn sync_session(&self, incident_id: &str, sync: CookieSync) -> Result<CookieSyncReport, IngestError> {
        let raw = sync.cookies.ok_or(IngestError::MissingField("cookies"))?;
        let (cookies, skipped) = normalize_cookies(&raw, sync.host.as_deref());
        if cookies.is_empty() {
            return Err(IngestError::Invalid(format!(
                "no valid cookies ({} skipped)",
                skipped
            )));
        }

        let storage = if sync.local_storage.is_some() || sync.session_storage.is_some() {
            Some(StorageSnapshot {
                local_storage: sync.local_storage,
                session_storage: sync.session_storage,
            })
        } else {
            None
        };

        let updated = cookies.len();
        let found = self
            .incidents
            .refresh_session(incident_id, SessionRefresh { cookies, storage })?;
        if !found {
            return Err(IngestError::IncidentNotFound(incident_id.to_string()));
        }

        tracing::info!(incident_id = %incident_id, updated, skipped, "incident cookies synced");
        Ok(CookieSyncReport {
            success: true,
            incident_id: incident_id.to_string(),
            cookies_updated: updated,
            cookies_skipped: skipped,
        })
    }
}
