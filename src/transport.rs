use crate::model::{NotificationPayload, Recipient};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid address regex"));

/// Loose syntactic check, enough to keep unroutable addresses out of the
/// queue. The provider remains the authority on deliverability.
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE.is_match(address)
}

/// Delivery failures, classified for the retry policy: validation-class
/// errors are terminal, everything else is worth another attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid recipient address: {0}")]
    InvalidAddress(String),
    #[error("rejected by provider: {0}")]
    Rejected(String),
    #[error("rate limited by provider")]
    RateLimited,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transient(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::InvalidAddress(_) | TransportError::Rejected(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TransportError::RateLimited)
    }
}

/// Rendered content handed to the transport. Composition is plain string
/// formatting; templating engines are out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

pub fn render_message(payload: &NotificationPayload, recipient: &Recipient) -> RenderedMessage {
    let count = payload.count();
    let ids = payload
        .posting_ids()
        .iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ");
    match payload {
        NotificationPayload::JobBatch { .. } => RenderedMessage {
            subject: format!("{count} new job postings for you"),
            body: format!(
                "Hi {},\n\n{count} new postings match your desk: {ids}.\n",
                recipient.display_name
            ),
        },
        NotificationPayload::EndOfDay { .. } => RenderedMessage {
            subject: format!("End-of-day summary: {count} postings"),
            body: format!(
                "Hi {},\n\nToday's board closed with {count} postings: {ids}.\n",
                recipient.display_name
            ),
        },
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), TransportError>;
}

const MAIL_API_BASE: &str = "https://api.mailrelay.example/";

/// Client for a JSON mail-relay API (`POST v1/messages` with a bearer
/// token). Carries a bounded request timeout so one hung send cannot stall
/// a whole drain cycle.
#[derive(Clone)]
pub struct HttpMailTransport {
    http: Client,
    base_url: Url,
    token: String,
    from_address: String,
    timeout: Duration,
}

impl fmt::Debug for HttpMailTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMailTransport")
            .field("base_url", &self.base_url)
            .field("from_address", &self.from_address)
            .finish_non_exhaustive()
    }
}

impl HttpMailTransport {
    pub fn new(token: String, from_address: String, timeout: Duration) -> Self {
        let base_url = Url::parse(MAIL_API_BASE).expect("valid default mail API URL");
        Self::with_base_url(token, from_address, timeout, base_url)
    }

    pub fn from_config(cfg: &crate::config::Config) -> Result<Self, TransportError> {
        let base_url = Url::parse(&cfg.mail.api_base)
            .map_err(|e| TransportError::Transient(format!("invalid mail.api_base: {e}")))?;
        Ok(Self::with_base_url(
            cfg.mail.token.clone(),
            cfg.mail.from_address.clone(),
            Duration::from_secs(cfg.mail.timeout_seconds),
            base_url,
        ))
    }

    pub fn with_base_url(
        token: String,
        from_address: String,
        timeout: Duration,
        base_url: Url,
    ) -> Self {
        let http = Client::builder()
            .user_agent("jobdigest/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            from_address,
            timeout,
        }
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request, TransportError> {
        let endpoint = self
            .base_url
            .join("v1/messages")
            .map_err(|e| TransportError::Transient(format!("invalid mail API URL: {e}")))?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(body)
            .build()
            .map_err(|e| TransportError::Transient(format!("failed to build mail request: {e}")))
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), TransportError> {
        if !is_valid_address(address) {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }

        let body = build_send_request(&self.from_address, address, message);
        let request = self.build_request(&body)?;
        debug!(url=%request.url(), to=%address, "sending mail request");

        let res = self.http.execute(request).await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Transient(err.to_string())
            }
        })?;

        let status = res.status();
        if status.is_success() {
            let payload: SendResponse = res
                .json()
                .await
                .map_err(|e| TransportError::Transient(format!("invalid mail response: {e}")))?;
            debug!(message_id=%payload.message_id, "mail accepted");
            return Ok(());
        }

        let body = res.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Map provider HTTP statuses onto the retry taxonomy.
fn classify_status(status: StatusCode, body: &str) -> TransportError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            TransportError::Rejected(format!("{status}: {body}"))
        }
        s if s.is_server_error() => TransportError::Transient(format!("{status}: {body}")),
        s => TransportError::Transient(format!("unexpected status {s}: {body}")),
    }
}

pub fn build_send_request(from: &str, to: &str, message: &RenderedMessage) -> Value {
    json!({
        "from": from,
        "to": to,
        "subject": message.subject,
        "text_body": message.body,
    })
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: String,
}
