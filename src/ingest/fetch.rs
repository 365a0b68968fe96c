use serde::Deserialize;
use serde_json::json;

use super::{
    host_of, parse_reported_at, required, truncate_utf8, Draft, IngestError, Receipt,
    ResultIngestor,
};
use crate::command::CommandType;

/// Result of a plain in-page fetch.
#[derive(Debug, Default, Deserialize)]
pub struct FetchResult {
    pub command_id: Option<String>,
    #[serde(alias = "machine_id")]
    pub agent_id: Option<String>,
    pub success: Option<bool>,
    pub url: Option<String>,
    pub status_code: Option<u16>,
    #[serde(alias = "html_content")]
    pub body: Option<String>,
    pub cookies: Option<Vec<serde_json::Value>>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub timestamp: Option<serde_json::Value>,
}

/// Result of a fetch tunnelled through the agent's browser session.
#[derive(Debug, Default, Deserialize)]
pub struct TunnelFetchResult {
    pub command_id: Option<String>,
    #[serde(alias = "machine_id")]
    pub agent_id: Option<String>,
    pub success: Option<bool>,
    pub status_code: Option<u16>,
    pub status_text: Option<String>,
    pub headers: Option<serde_json::Value>,
    pub body: Option<String>,
    pub encoding: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub final_url: Option<String>,
    pub redirected: Option<bool>,
    pub cookies: Option<Vec<serde_json::Value>>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub timestamp: Option<serde_json::Value>,
}

impl ResultIngestor {
    pub fn ingest_fetch(&self, result: FetchResult) -> Result<Receipt, IngestError> {
        let command_id = required(result.command_id, "command_id")?;
        let agent_id = required(result.agent_id, "agent_id")?;

        let mut draft = Draft::new(CommandType::Fetch, command_id, agent_id);
        draft.success = result.success.unwrap_or(result.error.is_none());
        draft.error = result.error;
        draft.error_type = result.error_type;
        draft.elapsed_ms = result.elapsed_ms;
        draft.reported_at = parse_reported_at(result.timestamp.as_ref());

        let mut body = result.body.unwrap_or_default();
        let original_bytes = body.len();
        draft.truncated = truncate_utf8(&mut body, self.limits.fetch_body);
        let cookies = result.cookies.unwrap_or_default();

        draft.summary = json!({
            "result_id": draft.result_id,
            "success": draft.success,
            "url": result.url,
            "status_code": result.status_code,
            "body_bytes": original_bytes,
            "truncated": draft.truncated,
            "error": draft.error,
        });
        draft.payload = json!({
            "url": result.url,
            "status_code": result.status_code,
            "body": body,
            "cookies": cookies,
        });

        let success = draft.success;
        let (receipt, command) = self.persist(draft)?;
        if success && !cookies.is_empty() {
            self.cascade_cookies(command.as_ref(), &cookies, host_of(result.url.as_deref()).as_deref());
        }
        Ok(receipt)
    }

    pub fn ingest_tunnel_fetch(&self, result: TunnelFetchResult) -> Result<Receipt, IngestError> {
        let command_id = required(result.command_id, "command_id")?;
        let agent_id = required(result.agent_id, "agent_id")?;

        let encoding = result.encoding.unwrap_or_else(|| "text".to_string());
        if encoding != "text" && encoding != "base64" {
            return Err(IngestError::Invalid(format!(
                "encoding must be 'text' or 'base64', got '{}'",
                encoding
            )));
        }

        let mut draft = Draft::new(CommandType::TunnelFetch, command_id, agent_id);
        draft.success = result.success.unwrap_or(result.error.is_none());
        draft.elapsed_ms = result.elapsed_ms;
        draft.reported_at = parse_reported_at(result.timestamp.as_ref());

        if !draft.success {
            draft.error = Some(result.error.unwrap_or_else(|| "unknown error".to_string()));
            draft.error_type = result.error_type;
            draft.payload = json!({});
            draft.summary = json!({
                "result_id": draft.result_id,
                "success": false,
                "error": draft.error,
                "error_type": draft.error_type,
                "elapsed_ms": draft.elapsed_ms,
            });
            let (receipt, _) = self.persist(draft)?;
            return Ok(receipt);
        }

        let mut body = result.body.unwrap_or_default();
        draft.truncated = truncate_utf8(&mut body, self.limits.tunnel_body);
        let cookies = result.cookies.unwrap_or_default();

        draft.summary = json!({
            "result_id": draft.result_id,
            "success": true,
            "status_code": result.status_code,
            "final_url": result.final_url,
            "content_type": result.content_type,
            "elapsed_ms": draft.elapsed_ms,
            "truncated": draft.truncated,
        });
        draft.payload = json!({
            "status_code": result.status_code,
            "status_text": result.status_text,
            "headers": result.headers,
            "body": body,
            "encoding": encoding,
            "content_type": result.content_type,
            "content_length": result.content_length,
            "final_url": result.final_url,
            "redirected": result.redirected.unwrap_or(false),
            "cookies": cookies,
        });

        let (receipt, command) = self.persist(draft)?;
        if !cookies.is_empty() {
            let host = host_of(result.final_url.as_deref());
            self.cascade_cookies(command.as_ref(), &cookies, host.as_deref());
        }
        Ok(receipt)
    }
}
