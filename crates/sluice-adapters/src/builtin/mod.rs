pub mod defaults;
pub mod field_ops;
pub mod filter;
pub mod http_json;
pub mod inline;
pub mod json_feed;
pub mod jsonl;
pub mod memory;
pub mod rules;
pub mod webhook;

use sluice_core::config::ConnectionConfig;
use sluice_core::context::AdapterContext;
use sluice_core::error::{Result, SluiceError};

/// Shared HTTP client for the network adapters.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Target of a network step: an explicit `url`, or a named connection
/// plus an optional `path`.
pub(crate) struct Endpoint {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
}

pub(crate) fn resolve_endpoint(
    ctx: &AdapterContext,
    url: Option<&str>,
    connection: Option<&str>,
    path: Option<&str>,
    token_secret: Option<&str>,
) -> Result<Endpoint> {
    let default_conn = ConnectionConfig::default();
    let conn = match connection {
        Some(code) => ctx.connection(code)?,
        None => &default_conn,
    };
    let base = url
        .map(str::to_string)
        .or_else(|| conn.url.clone())
        .ok_or_else(|| SluiceError::adapter(&ctx.step_key, "no url or connection url configured"))?;
    let url = match path {
        Some(p) => format!("{}/{}", base.trim_end_matches('/'), p.trim_start_matches('/')),
        None => base,
    };
    let secret = token_secret.or(conn.token_secret.as_deref());
    let bearer = secret.map(|s| ctx.secret(s)).transpose()?;
    let headers = conn
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(Endpoint {
        url,
        headers,
        bearer,
    })
}

impl Endpoint {
    pub fn apply(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }
        req
    }
}
