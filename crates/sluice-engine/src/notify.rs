//! Gate pause notifications: webhook POST and email summary.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use sluice_core::checkpoint::GateCheckpoint;
use sluice_core::config::GateSettings;
use sluice_core::error::{Result, SluiceError};
use sluice_core::pipeline::{ApprovalType, GateConfig};
use sluice_core::traits::Mailer;
use sluice_core::types::{Record, RunId};

const PREVIEW_STRING_LIMIT: usize = 200;

/// Body of the webhook fired when a gate pauses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePausedNotice {
    pub event: &'static str,
    pub run_id: RunId,
    pub pipeline: String,
    pub step_key: String,
    pub approval_type: ApprovalType,
    pub record_count: usize,
    pub preview: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl GatePausedNotice {
    fn email_body(&self) -> String {
        let mut body = format!(
            "Pipeline '{}' paused at gate '{}' (run {}).\n\
             Approval type: {}\n\
             Pending records: {}\n",
            self.pipeline,
            self.step_key,
            self.run_id,
            self.approval_type.as_str(),
            self.record_count
        );
        if let Some(at) = self.expires_at {
            body.push_str(&format!("Auto-approves at: {}\n", at.to_rfc3339()));
        }
        if !self.preview.is_empty() {
            body.push_str("\nPreview:\n");
            for record in &self.preview {
                body.push_str(&format!("  {}\n", Value::Object(record.clone())));
            }
        }
        body
    }
}

fn truncate_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > PREVIEW_STRING_LIMIT => {
            let cut: String = s.chars().take(PREVIEW_STRING_LIMIT).collect();
            Value::String(format!("{cut}..."))
        }
        Value::Array(items) => Value::Array(items.iter().map(truncate_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// First `limit` records with long strings shortened.
pub fn preview(records: &[Record], limit: usize) -> Vec<Record> {
    records
        .iter()
        .take(limit)
        .map(|r| r.iter().map(|(k, v)| (k.clone(), truncate_value(v))).collect())
        .collect()
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_internal(IpAddr::V4(v4)))
        }
    }
}

/// A webhook URL that passed [`check_webhook_target`].
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub url: reqwest::Url,
    /// Address the host resolved to when it was vetted. Requests connect
    /// here instead of resolving the name a second time.
    pub pinned: Option<SocketAddr>,
}

impl WebhookTarget {
    /// Finish `builder` with the vetted address pinned for the target host.
    pub fn client(&self, builder: reqwest::ClientBuilder) -> Result<reqwest::Client> {
        let builder = match (self.url.host_str(), self.pinned) {
            (Some(host), Some(addr)) => builder.resolve(host, addr),
            _ => builder,
        };
        builder.build().map_err(|e| SluiceError::Http(e.to_string()))
    }
}

/// Reject webhook targets that are not http(s) or that resolve to a
/// loopback, private, link-local or unspecified address.
pub async fn check_webhook_target(url: &str, allow_private: bool) -> Result<WebhookTarget> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| SluiceError::Ssrf(format!("{url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SluiceError::Ssrf(format!(
            "{url}: scheme '{}' not allowed",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| SluiceError::Ssrf(format!("{url}: missing host")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if allow_private {
        return Ok(WebhookTarget {
            url: parsed,
            pinned: None,
        });
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_internal(ip) {
            return Err(SluiceError::Ssrf(format!("{url}: internal address {ip}")));
        }
        return Ok(WebhookTarget {
            url: parsed,
            pinned: None,
        });
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| SluiceError::Ssrf(format!("{url}: cannot resolve {host}: {e}")))?
        .collect();
    if let Some(addr) = addrs.iter().find(|a| is_internal(a.ip())) {
        return Err(SluiceError::Ssrf(format!(
            "{url}: {host} resolves to internal address {}",
            addr.ip()
        )));
    }
    match addrs.first() {
        Some(addr) => Ok(WebhookTarget {
            url: parsed,
            pinned: Some(*addr),
        }),
        None => Err(SluiceError::Ssrf(format!("{url}: {host} did not resolve"))),
    }
}

/// Mailer that only logs. Used when no transport is configured.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &[String], subject: &str, body: &str) -> BoxFuture<'_, Result<()>> {
        info!(to = ?to, subject, chars = body.len(), "Email notification (log only)");
        Box::pin(async { Ok(()) })
    }
}

/// Sends gate pause notifications. Delivery never blocks the run.
#[derive(Clone)]
pub struct GateNotifier {
    timeout: Duration,
    mailer: Arc<dyn Mailer>,
    preview_records: usize,
    allow_private: bool,
}

impl GateNotifier {
    pub fn new(settings: &GateSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.notify_timeout_secs),
            mailer: Arc::new(LogMailer),
            preview_records: settings.preview_records,
            allow_private: settings.allow_private_webhooks,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn notice(
        &self,
        run_id: &RunId,
        pipeline: &str,
        step_key: &str,
        gate: &GateCheckpoint,
        expires_at: Option<DateTime<Utc>>,
    ) -> GatePausedNotice {
        GatePausedNotice {
            event: "gate.paused",
            run_id: run_id.clone(),
            pipeline: pipeline.to_string(),
            step_key: step_key.to_string(),
            approval_type: gate.approval_type,
            record_count: gate.pending_record_count,
            preview: preview(&gate.pending_records, self.preview_records),
            expires_at,
            timestamp: Utc::now(),
        }
    }

    /// Fire-and-forget delivery; failures are logged.
    pub fn notify(&self, notice: GatePausedNotice, config: &GateConfig) {
        if config.webhook_url.is_none() && config.email.is_empty() {
            return;
        }
        let notifier = self.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(&notice, &config).await {
                warn!(
                    run_id = %notice.run_id,
                    step_key = %notice.step_key,
                    error = %e,
                    "Gate notification failed"
                );
            }
        });
    }

    /// Send the webhook and the email, attempting both before reporting
    /// the first failure.
    pub async fn deliver(&self, notice: &GatePausedNotice, config: &GateConfig) -> Result<()> {
        let mut first_error = None;

        if let Some(url) = &config.webhook_url {
            if let Err(e) = self.post(url, notice).await {
                first_error.get_or_insert(e);
            }
        }

        if !config.email.is_empty() {
            let subject = format!(
                "[sluice] {} awaiting approval at {}",
                notice.pipeline, notice.step_key
            );
            if let Err(e) = self
                .mailer
                .send(&config.email, &subject, &notice.email_body())
                .await
            {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn post(&self, url: &str, notice: &GatePausedNotice) -> Result<()> {
        let target = check_webhook_target(url, self.allow_private).await?;
        let client = target.client(
            reqwest::Client::builder()
                .timeout(self.timeout)
                .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION"))),
        )?;
        let resp = client
            .post(target.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| SluiceError::Notification(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SluiceError::Notification(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        info!(run_id = %notice.run_id, step_key = %notice.step_key, "Gate webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use sluice_test_utils::{numbered, record, RecordingMailer};
    use std::sync::Mutex;

    #[tokio::test]
    async fn rejects_internal_and_non_http_targets() {
        for url in [
            "http://127.0.0.1/hook",
            "http://10.1.2.3/hook",
            "http://192.168.0.10:8080/hook",
            "http://169.254.169.254/latest",
            "http://[::1]/hook",
            "http://0.0.0.0/",
            "ftp://93.184.216.34/file",
            "not a url",
        ] {
            assert!(
                check_webhook_target(url, false).await.is_err(),
                "{url} should be rejected"
            );
        }
        let public = check_webhook_target("https://93.184.216.34/hook", false)
            .await
            .unwrap();
        assert!(public.pinned.is_none());
        assert!(check_webhook_target("http://127.0.0.1:9/hook", true)
            .await
            .is_ok());
    }

    #[test]
    fn preview_truncates_long_strings() {
        let long = "x".repeat(500);
        let records = vec![
            record(json!({"id": 1, "note": long, "nested": {"s": "y".repeat(300)}})),
            record(json!({"id": 2})),
        ];
        let out = preview(&records, 1);
        assert_eq!(out.len(), 1);
        let note = out[0]["note"].as_str().unwrap();
        assert_eq!(note.len(), PREVIEW_STRING_LIMIT + 3);
        assert!(note.ends_with("..."));
        assert!(out[0]["nested"]["s"].as_str().unwrap().ends_with("..."));
    }

    type Seen = Arc<Mutex<Vec<Value>>>;

    async fn capture(State(seen): State<Seen>, Json(body): Json<Value>) {
        seen.lock().unwrap().push(body);
    }

    #[tokio::test]
    async fn pinned_target_connects_without_resolving_the_host() {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/gate", post(capture))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // .invalid never resolves, so the request only lands through the pin
        let target = WebhookTarget {
            url: reqwest::Url::parse(&format!("http://hooks.sluice.invalid:{}/gate", addr.port()))
                .unwrap(),
            pinned: Some(addr),
        };
        let client = target.client(reqwest::Client::builder()).unwrap();
        let resp = client
            .post(target.url.clone())
            .json(&json!({"ping": true}))
            .send()
            .await
            .unwrap();

        assert!(resp.status().is_success());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivers_webhook_and_email() {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/gate", post(capture))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = GateSettings {
            allow_private_webhooks: true,
            preview_records: 2,
            ..GateSettings::default()
        };
        let mailer = RecordingMailer::new();
        let notifier = GateNotifier::new(&settings).with_mailer(Arc::new(mailer.clone()));
        let gate = GateCheckpoint {
            approval_type: ApprovalType::Manual,
            pending_record_count: 5,
            pending_records: numbered(5),
            paused_at: Utc::now(),
        };
        let notice = notifier.notice(&RunId::from_string("run-9"), "orders", "review", &gate, None);
        let config = GateConfig::manual()
            .with_webhook(format!("http://{addr}/gate"))
            .with_email("ops@example.com");

        notifier.deliver(&notice, &config).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["event"], json!("gate.paused"));
        assert_eq!(seen[0]["runId"], json!("run-9"));
        assert_eq!(seen[0]["stepKey"], json!("review"));
        assert_eq!(seen[0]["approvalType"], json!("MANUAL"));
        assert_eq!(seen[0]["recordCount"], json!(5));
        assert_eq!(seen[0]["preview"].as_array().unwrap().len(), 2);

        let mail = mailer.sent();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].to, vec!["ops@example.com".to_string()]);
        assert!(mail[0].body.contains("Pending records: 5"));
    }

    #[tokio::test]
    async fn private_webhook_blocked_by_default() {
        let notifier = GateNotifier::new(&GateSettings::default());
        let gate = GateCheckpoint {
            approval_type: ApprovalType::Manual,
            pending_record_count: 0,
            pending_records: vec![],
            paused_at: Utc::now(),
        };
        let notice = notifier.notice(&RunId::from_string("r"), "p", "g", &gate, None);
        let config = GateConfig::manual().with_webhook("http://127.0.0.1:1/gate");
        assert!(matches!(
            notifier.deliver(&notice, &config).await,
            Err(SluiceError::Ssrf(_))
        ));
    }
}
