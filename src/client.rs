//! HTTP client for producers: submit commands and inspect their state.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Api { status: u16, code: String, message: String },
}

/// A command as submitted by a producer.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitCommand {
    pub command_type: String,
    pub target_agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_sub_resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub payload: Value,
}

pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, ClientError> {
        let resp = self.authorized(req).send().await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        if status.is_success() {
            return Ok(body);
        }
        Err(ClientError::Api {
            status: status.as_u16(),
            code: body["code"].as_str().unwrap_or("unknown").to_string(),
            message: body["error"].as_str().unwrap_or("").to_string(),
        })
    }

    pub async fn submit(&self, command: &SubmitCommand) -> Result<Value, ClientError> {
        self.send(self.http.post(self.url("/commands")).json(command)).await
    }

    pub async fn command(&self, id: &str) -> Result<Value, ClientError> {
        self.send(self.http.get(self.url(&format!("/commands/{}", id)))).await
    }

    pub async fn results(&self, id: &str) -> Result<Value, ClientError> {
        self.send(self.http.get(self.url(&format!("/commands/{}/results", id)))).await
    }

    pub async fn agents(&self) -> Result<Value, ClientError> {
        self.send(self.http.get(self.url("/agents"))).await
    }
}
