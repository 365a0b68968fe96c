use serde::Deserialize;
use serde_json::json;

use super::{
    parse_reported_at, required, truncate_strings, truncate_utf8, Draft, IngestError, Receipt,
    ResultIngestor,
};
use crate::command::{CommandType, NewCommand};

/// Field names listed in a popup summary.
const POPUP_SUMMARY_FIELDS: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct ScreenshotResult {
    /// Absent when the agent captured on its own initiative.
    pub command_id: Option<String>,
    #[serde(alias = "machine_id")]
    pub agent_id: Option<String>,
    /// Data URL or bare base64.
    #[serde(alias = "screenshot", alias = "data_url")]
    pub image: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotResult {
    pub command_id: Option<String>,
    #[serde(alias = "machine_id")]
    pub agent_id: Option<String>,
    pub success: Option<bool>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub html: Option<String>,
    pub resources: Option<serde_json::Value>,
    pub viewport: Option<serde_json::Value>,
    pub captured_at: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PopupResult {
    pub command_id: Option<String>,
    #[serde(alias = "machine_id")]
    pub agent_id: Option<String>,
    pub domain: Option<String>,
    pub url: Option<String>,
    pub form_data: Option<serde_json::Value>,
}

impl ResultIngestor {
    /// Store a screenshot. Without a `command_id` the capture is recorded as
    /// a new `executed` screenshot command that carries the summary.
    pub fn ingest_screenshot(&self, result: ScreenshotResult) -> Result<Receipt, IngestError> {
        let agent_id = required(result.agent_id, "agent_id")?;
        let mut image = required(result.image, "image")?;
        let image_bytes = image.len();
        let truncated = truncate_utf8(&mut image, self.limits.screenshot_image);
        let reported_at = parse_reported_at(result.timestamp.as_ref());

        // command_id is filled in below once it is known.
        let mut draft = Draft::new(CommandType::Screenshot, String::new(), agent_id);
        draft.truncated = truncated;
        draft.reported_at = reported_at;
        draft.summary = json!({
            "result_id": draft.result_id,
            "url": result.url,
            "domain": result.domain,
            "captured_at": reported_at,
            "metadata": result.metadata,
            "image_bytes": image_bytes,
            "truncated": truncated,
        });
        draft.payload = json!({
            "image": image,
            "url": result.url,
            "domain": result.domain,
            "metadata": result.metadata,
        });

        match result.command_id.filter(|id| !id.trim().is_empty()) {
            Some(command_id) => {
                draft.command_id = command_id;
                let (receipt, _) = self.persist(draft)?;
                Ok(receipt)
            }
            None => {
                let command = self.commands.insert_executed(
                    NewCommand::new(CommandType::Screenshot, draft.agent_id.clone())
                        .with_payload(json!({"url": result.url, "domain": result.domain}))
                        .with_response(draft.summary.clone()),
                    draft.record(),
                )?;
                draft.command_id = command.id;
                tracing::info!(
                    command_id = %draft.command_id,
                    agent_id = %draft.agent_id,
                    truncated,
                    "agent-initiated screenshot recorded"
                );
                Ok(draft.receipt())
            }
        }
    }

    pub fn ingest_snapshot(&self, result: SnapshotResult) -> Result<Receipt, IngestError> {
        let command_id = required(result.command_id, "command_id")?;
        let agent_id = required(result.agent_id, "agent_id")?;

        let mut draft = Draft::new(CommandType::Snapshot, command_id, agent_id);
        draft.success = result.success.unwrap_or(result.error.is_none());
        draft.error = result.error;
        draft.reported_at = parse_reported_at(result.captured_at.as_ref());

        let mut html = result.html.unwrap_or_default();
        let html_bytes = html.len();
        draft.truncated = truncate_utf8(&mut html, self.limits.snapshot_html);

        draft.summary = json!({
            "result_id": draft.result_id,
            "success": draft.success,
            "url": result.url,
            "title": result.title,
            "html_bytes": html_bytes,
            "truncated": draft.truncated,
            "error": draft.error,
        });
        draft.payload = json!({
            "url": result.url,
            "title": result.title,
            "html": html,
            "resources": result.resources,
            "viewport": result.viewport,
            "captured_at": result.captured_at,
        });

        let (receipt, _) = self.persist(draft)?;
        Ok(receipt)
    }

    pub fn ingest_popup(&self, result: PopupResult) -> Result<Receipt, IngestError> {
        let command_id = required(result.command_id, "command_id")?;
        let agent_id = required(result.agent_id, "agent_id")?;
        let domain = required(result.domain, "domain")?;
        let mut form_data = match result.form_data {
            Some(v @ serde_json::Value::Object(_)) => v,
            Some(_) => {
                return Err(IngestError::Invalid("form_data must be an object".to_string()))
            }
            None => return Err(IngestError::MissingField("form_data")),
        };

        let mut draft = Draft::new(CommandType::Popup, command_id, agent_id);
        draft.truncated = truncate_strings(&mut form_data, self.limits.popup_field);

        let fields: Vec<&String> = form_data
            .as_object()
            .map(|m| m.keys().take(POPUP_SUMMARY_FIELDS).collect())
            .unwrap_or_default();
        let field_count = form_data.as_object().map(|m| m.len()).unwrap_or(0);

        draft.summary = json!({
            "result_id": draft.result_id,
            "domain": domain,
            "url": result.url,
            "field_count": field_count,
            "fields": fields,
            "truncated": draft.truncated,
        });
        draft.payload = json!({
            "domain": domain,
            "url": result.url,
            "form_data": form_data,
        });

        let (receipt, _) = self.persist(draft)?;
        Ok(receipt)
    }
}
