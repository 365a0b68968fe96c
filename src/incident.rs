//! The dependent aggregate ("incident") that session-bearing results refresh.
//!
//! Incidents are owned by an external collaborator. This crate only ever
//! replaces their session fields and bumps `updated_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of cookies quoted in an excerpt.
const EXCERPT_COOKIES: usize = 3;

/// Characters of each cookie value quoted in an excerpt.
const EXCERPT_VALUE_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<f64>,
    pub is_session: bool,
}

/// Cookie as reported by an agent; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCookie {
    name: Option<String>,
    value: Option<serde_json::Value>,
    domain: Option<String>,
    path: Option<String>,
    secure: Option<bool>,
    #[serde(alias = "http_only")]
    http_only: Option<bool>,
    #[serde(alias = "same_site")]
    same_site: Option<String>,
    #[serde(alias = "expiration_date")]
    expiration_date: Option<f64>,
    #[serde(alias = "is_session")]
    is_session: Option<bool>,
}

/// Normalize agent-reported cookies.
///
/// Entries without a name or value are skipped. An empty domain is replaced
/// with `.{host}` when a host is known, path defaults to `/`, sameSite to
/// `Lax`, and a cookie without a positive expiration is a session cookie.
/// Returns the valid cookies and the number skipped.
pub fn normalize_cookies(raw: &[serde_json::Value], host: Option<&str>) -> (Vec<Cookie>, usize) {
    let mut cookies = Vec::with_capacity(raw.len());
    let mut skipped = 0;

    for entry in raw {
        let parsed: RawCookie = match serde_json::from_value(entry.clone()) {
            Ok(c) => c,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        let name = match parsed.name {
            Some(n) if !n.is_empty() => n,
            _ => {
                tracing::debug!("skipping cookie without a name");
                skipped += 1;
                continue;
            }
        };
        let value = match parsed.value {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => {
                tracing::debug!(cookie = %name, "skipping cookie without a value");
                skipped += 1;
                continue;
            }
            Some(other) => other.to_string(),
        };

        let mut domain = parsed.domain.unwrap_or_default();
        if domain.is_empty() {
            if let Some(host) = host.filter(|h| !h.is_empty()) {
                domain = if host.starts_with('.') {
                    host.to_string()
                } else {
                    format!(".{}", host)
                };
            }
        }

        let is_session = parsed.is_session.unwrap_or_else(|| {
            parsed.expiration_date.map(|exp| exp <= 0.0).unwrap_or(true)
        });

        cookies.push(Cookie {
            name,
            value,
            domain,
            path: parsed.path.filter(|p| !p.is_empty()).unwrap_or_else(|| "/".to_string()),
            secure: parsed.secure.unwrap_or(false),
            http_only: parsed.http_only.unwrap_or(false),
            same_site: parsed
                .same_site
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Lax".to_string()),
            expiration_date: parsed.expiration_date,
            is_session,
        });
    }

    (cookies, skipped)
}

/// Short human-readable summary of a cookie set.
pub fn cookie_excerpt(cookies: &[Cookie]) -> String {
    if cookies.is_empty() {
        return "No cookies".to_string();
    }
    let quoted: Vec<String> = cookies
        .iter()
        .take(EXCERPT_COOKIES)
        .map(|c| {
            let value: String = c.value.chars().take(EXCERPT_VALUE_CHARS).collect();
            format!("{}={}...", c.name, value)
        })
        .collect();
    format!("{} cookies detected: {}", cookies.len(), quoted.join(", "))
}

/// Browser storage captured alongside cookies. Either side may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub local_storage: Option<serde_json::Value>,
    pub session_storage: Option<serde_json::Value>,
}

/// A replacement of an incident's session fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRefresh {
    pub cookies: Vec<Cookie>,
    /// `None` leaves the stored storage snapshot untouched.
    pub storage: Option<StorageSnapshot>,
}

impl SessionRefresh {
    pub fn cookies_only(cookies: Vec<Cookie>) -> Self {
        Self {
            cookies,
            storage: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub cookies: Vec<Cookie>,
    pub cookie_excerpt: Option<String>,
    pub local_storage: Option<serde_json::Value>,
    pub session_storage: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cookies: Vec::new(),
            cookie_excerpt: None,
            local_storage: None,
            session_storage: None,
            updated_at: Utc::now(),
        }
    }

    /// Replace the session fields in place and bump `updated_at`.
    pub fn apply(&mut self, refresh: SessionRefresh) {
        self.cookie_excerpt = Some(cookie_excerpt(&refresh.cookies));
        self.cookies = refresh.cookies;
        if let Some(storage) = refresh.storage {
            self.local_storage = storage.local_storage;
            self.session_storage = storage.session_storage;
        }
        self.updated_at = Utc::now();
    }
}
