use chrono::{DateTime, NaiveTime, Utc};
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use uuid::Uuid;

const NIGHTLY_RESTART_MESSAGE: &str = "server closed the connection";

/// Out-of-band escalation channel. Implementations never fail back into the
/// caller.
#[allow(async_fn_in_trait)]
pub trait Alerter {
    async fn notify(&self, error: &dyn Display, context: &str, via_email: bool, via_sms: bool);
}

#[derive(Serialize)]
struct AlertPayload<'a> {
    job: &'a str,
    run_id: Uuid,
    context: &'a str,
    error: String,
    email: bool,
    sms: bool,
    fingerprint: String,
    raised_at: DateTime<Utc>,
}

/// Posts alerts to an HTTP relay that fans out to email and SMS.
#[derive(Clone)]
pub struct WebhookAlerter {
    client: Client,
    url: Option<String>,
    token: Option<String>,
    job: String,
    run_id: Uuid,
}

impl WebhookAlerter {
    pub fn new(url: Option<String>, token: Option<String>, job: &str, run_id: Uuid) -> Self {
        Self {
            client: Client::new(),
            url,
            token,
            job: job.to_string(),
            run_id,
        }
    }
}

impl Alerter for WebhookAlerter {
    async fn notify(&self, error: &dyn Display, context: &str, via_email: bool, via_sms: bool) {
        let message = error.to_string();
        let now = Utc::now();
        if is_suppressed(&message, now) {
            tracing::info!(context, error = %message, "suppressing alert during nightly database restart");
            return;
        }

        tracing::error!(context, error = %message, email = via_email, sms = via_sms, "raising alert");
        let Some(url) = self.url.as_deref() else {
            return;
        };

        let payload = AlertPayload {
            job: &self.job,
            run_id: self.run_id,
            context,
            fingerprint: fingerprint(context, &message),
            error: message,
            email: via_email,
            sms: via_sms,
            raised_at: now,
        };

        let mut request = self.client.post(url).json(&payload);
        if let Some(token) = self.token.as_deref() {
            request = request.header("X-Alert-Token", token);
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "alert relay returned non-success");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "alert relay unreachable");
            }
        }
    }
}

/// Stable identity of an alert so the relay can collapse repeats.
fn fingerprint(context: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.as_bytes());
    hasher.update(b"\n");
    hasher.update(message.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The database is restarted every morning just after 09:00 UTC; dropped
/// connections inside that window are expected.
fn is_suppressed(message: &str, now: DateTime<Utc>) -> bool {
    let begin = NaiveTime::from_hms_opt(9, 0, 0);
    let end = NaiveTime::from_hms_opt(9, 3, 0);
    let (Some(begin), Some(end)) = (begin, end) else {
        return false;
    };
    let time = now.time();
    time >= begin && time <= end && message.contains(NIGHTLY_RESTART_MESSAGE)
}
