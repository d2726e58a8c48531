//! HTTP webhook channel sender.
//!
//! Each contact attempt is POSTed (or sent with the configured method) as
//!
//! ```json
//! {"tier": "sms_link", "destination": "+1555...", "message": "...", "context": {...}}
//! ```
//!
//! and the provider answers with a [`SendReceipt`]:
//!
//! ```json
//! {"delivered": true, "outcome": "unanswered", "provider_error": null}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use followup_escalation::{ChannelError, ChannelSender, SendReceipt, TemplateContext, Tier};
use reqwest::StatusCode;
use serde::Serialize;

use crate::error::NotifyError;
use crate::templating::{default_template, MessageRenderer};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    tier: Tier,
    destination: &'a str,
    message: &'a str,
    context: &'a TemplateContext,
}

/// Delivers one tier's contact attempts to an HTTP endpoint.
///
/// Environment variable references (`${VAR_NAME}`) in the URL and header
/// values are resolved at construction time.
#[derive(Debug)]
pub struct WebhookSender {
    tier: Tier,
    /// Target URL (env vars already resolved).
    url: String,
    method: reqwest::Method,
    headers: HashMap<String, String>,
    template: String,
    /// Free-form values exposed to the template.
    extra: BTreeMap<String, String>,
    renderer: Arc<MessageRenderer>,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl WebhookSender {
    /// Create a sender for `tier`.
    ///
    /// `method` defaults to `POST` and `template` to the tier's
    /// [`default_template`]. Missing env vars and invalid templates produce
    /// [`NotifyError::Config`].
    pub fn new(
        tier: Tier,
        url: &str,
        method: Option<reqwest::Method>,
        headers: HashMap<String, String>,
        template: Option<String>,
        extra: BTreeMap<String, String>,
        renderer: Arc<MessageRenderer>,
    ) -> Result<Self, NotifyError> {
        let resolved_url = expand_env_refs(url)?;

        let mut resolved_headers = HashMap::with_capacity(headers.len());
        for (key, value) in &headers {
            resolved_headers.insert(key.clone(), expand_env_refs(value)?);
        }

        let template = template.unwrap_or_else(|| default_template(tier).to_string());
        renderer
            .validate(&template)
            .map_err(|e| NotifyError::Config(format!("invalid {tier} template: {e}")))?;

        Ok(Self {
            tier,
            url: resolved_url,
            method: method.unwrap_or(reqwest::Method::POST),
            headers: resolved_headers,
            template,
            extra,
            renderer,
            client: reqwest::Client::builder().build()?,
        })
    }

    /// Parse `method` from a config string (e.g. `"POST"`, `"put"`).
    pub fn parse_method(method: &str) -> Result<reqwest::Method, NotifyError> {
        method
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|_| NotifyError::Config(format!("invalid HTTP method: {method}")))
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    async fn send(
        &self,
        destination: &str,
        context: &TemplateContext,
    ) -> Result<SendReceipt, ChannelError> {
        let message = self
            .renderer
            .render(&self.template, context, destination, &self.extra)
            .map_err(|e| ChannelError::Permanent(e.to_string()))?;

        let payload = WebhookPayload {
            tier: self.tier,
            destination,
            message: &message,
            context,
        };

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .json(&payload);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Transient(format!("request to {} failed: {e}", self.url)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChannelError::Transient(format!("failed to read response body: {e}")))?;

        let result = interpret_response(status, &body);
        match &result {
            Ok(receipt) => tracing::debug!(
                url = %self.url,
                tier = %self.tier,
                %status,
                delivered = receipt.delivered,
                outcome = ?receipt.outcome,
                "webhook answered"
            ),
            Err(e) => tracing::warn!(
                url = %self.url,
                tier = %self.tier,
                %status,
                error = %e,
                "webhook send failed"
            ),
        }
        result
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Map an HTTP response onto a receipt or a classified channel error.
///
/// 2xx must carry a parsable receipt; 408, 429, and 5xx are retryable;
/// every other status is a permanent rejection.
fn interpret_response(status: StatusCode, body: &str) -> Result<SendReceipt, ChannelError> {
    if status.is_success() {
        return serde_json::from_str::<SendReceipt>(body).map_err(|e| {
            ChannelError::Transient(format!("unparsable receipt ({status}): {e}"))
        });
    }
    let detail = format!("webhook returned {status}: {}", truncate(body, 200));
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(ChannelError::Transient(detail))
    } else {
        Err(ChannelError::Permanent(detail))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Substitute `${NAME}` references in a URL or header value with
/// environment variables. An unset variable or an unterminated reference is
/// a config error.
fn expand_env_refs(input: &str) -> Result<String, NotifyError> {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, NotifyError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find('}').ok_or_else(|| {
            NotifyError::Config(format!("unterminated ${{...}} reference in {input:?}"))
        })?;
        let name = &after[..close];
        if name.is_empty() {
            return Err(NotifyError::Config(format!("empty ${{}} reference in {input:?}")));
        }
        let value = lookup(name).ok_or_else(|| {
            NotifyError::Config(format!("environment variable {name} is not set"))
        })?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use followup_escalation::Outcome;

    fn ctx() -> TemplateContext {
        TemplateContext {
            job_id: "s1:sms_link".into(),
            session_id: "s1".into(),
            resolution_id: "r1".into(),
            end_user_id: "u1".into(),
            tier: Tier::SmsLink,
            attempt: 1,
            max_attempts: 2,
        }
    }

    fn sender(url: &str, headers: HashMap<String, String>, template: Option<&str>) -> WebhookSender {
        WebhookSender::new(
            Tier::SmsLink,
            url,
            None,
            headers,
            template.map(str::to_string),
            BTreeMap::new(),
            Arc::new(MessageRenderer::new()),
        )
        .unwrap()
    }

    type Captured = Arc<Mutex<Vec<(HeaderMap, serde_json::Value)>>>;

    /// Local provider stub: `/ok` answers refused, `/down` 503, `/reject` 400,
    /// `/garbage` a 200 with a non-JSON body.
    async fn provider() -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));

        async fn ok(
            State(captured): State<Captured>,
            headers: HeaderMap,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            captured.lock().unwrap().push((headers, body));
            Json(serde_json::json!({"delivered": true, "outcome": "refused"}))
        }

        let app = Router::new()
            .route("/ok", post(ok))
            .route("/down", post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }))
            .route("/reject", post(|| async { (StatusCode::BAD_REQUEST, "bad number") }))
            .route("/garbage", post(|| async { "<html>hello</html>" }))
            .with_state(captured.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    #[tokio::test]
    async fn posts_payload_and_parses_receipt() {
        let (base, captured) = provider().await;
        std::env::set_var("WT_PROVIDER_TOKEN", "tok-123");
        let headers = HashMap::from([(
            "Authorization".to_string(),
            "Bearer ${WT_PROVIDER_TOKEN}".to_string(),
        )]);
        let s = sender(&format!("{base}/ok"), headers, Some("Hi {{ end_user_id }}"));
        std::env::remove_var("WT_PROVIDER_TOKEN");

        let receipt = s.send("+15550100", &ctx()).await.unwrap();
        assert!(receipt.delivered);
        assert_eq!(receipt.outcome, Outcome::Refused);

        let captured = captured.lock().unwrap();
        let (headers, body) = &captured[0];
        assert_eq!(headers["authorization"], "Bearer tok-123");
        assert_eq!(body["tier"], "sms_link");
        assert_eq!(body["destination"], "+15550100");
        assert_eq!(body["message"], "Hi u1");
        assert_eq!(body["context"]["session_id"], "s1");
        assert_eq!(body["context"]["attempt"], 1);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let (base, _) = provider().await;
        let err = sender(&format!("{base}/down"), HashMap::new(), None)
            .send("+1", &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transient(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let (base, _) = provider().await;
        let err = sender(&format!("{base}/reject"), HashMap::new(), None)
            .send("+1", &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Permanent(ref m) if m.contains("bad number")));
    }

    #[tokio::test]
    async fn unparsable_success_body_is_transient() {
        let (base, _) = provider().await;
        let err = sender(&format!("{base}/garbage"), HashMap::new(), None)
            .send("+1", &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transient(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = sender(&format!("http://{addr}/ok"), HashMap::new(), None)
            .send("+1", &ctx())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn interpret_undelivered_receipt() {
        let receipt = interpret_response(
            StatusCode::OK,
            r#"{"delivered": false, "outcome": "unanswered", "provider_error": "carrier down"}"#,
        )
        .unwrap();
        assert!(!receipt.delivered);
        assert_eq!(receipt.provider_error.as_deref(), Some("carrier down"));
    }

    #[test]
    fn interpret_rate_limit_as_transient() {
        let err = interpret_response(StatusCode::TOO_MANY_REQUESTS, "slow down").unwrap_err();
        assert!(err.is_retryable());
    }

    fn vars(name: &str) -> Option<String> {
        match name {
            "SMS_HOST" => Some("sms.internal".into()),
            "SMS_TOKEN" => Some("t0k".into()),
            _ => None,
        }
    }

    #[test]
    fn env_refs_are_substituted_in_place() {
        let out = expand_with("https://${SMS_HOST}/send?key=${SMS_TOKEN}", vars).unwrap();
        assert_eq!(out, "https://sms.internal/send?key=t0k");
        assert_eq!(expand_with("no refs, $ alone", vars).unwrap(), "no refs, $ alone");
    }

    #[test]
    fn unset_env_ref_names_the_variable() {
        match expand_with("Bearer ${SMS_SECRET}", vars).unwrap_err() {
            NotifyError::Config(msg) => assert!(msg.contains("SMS_SECRET"), "{msg}"),
            other => panic!("expected Config error, got: {other:?}"),
        }
    }

    #[test]
    fn malformed_env_refs_are_rejected() {
        for input in ["https://${SMS_HOST/send", "x${}y"] {
            assert!(
                matches!(expand_with(input, vars), Err(NotifyError::Config(_))),
                "{input}"
            );
        }
    }

    #[test]
    fn sender_construction_fails_on_unset_url_variable() {
        let result = WebhookSender::new(
            Tier::SmsLink,
            "https://${FOLLOWUP_TEST_UNSET_HOST_7731}/send",
            None,
            HashMap::new(),
            None,
            BTreeMap::new(),
            Arc::new(MessageRenderer::new()),
        );
        assert!(matches!(result, Err(NotifyError::Config(_))));
    }

    #[test]
    fn parse_method_is_case_insensitive() {
        assert_eq!(WebhookSender::parse_method("put").unwrap(), reqwest::Method::PUT);
        assert!(WebhookSender::parse_method("NOT A METHOD").is_err());
    }

    #[test]
    fn invalid_template_is_rejected() {
        let result = WebhookSender::new(
            Tier::EmailLink,
            "https://example.com",
            None,
            HashMap::new(),
            Some("{{ unclosed".into()),
            BTreeMap::new(),
            Arc::new(MessageRenderer::new()),
        );
        match result.unwrap_err() {
            NotifyError::Config(msg) => assert!(msg.contains("invalid email_link template")),
            other => panic!("expected Config error, got: {other:?}"),
        }
    }
}
