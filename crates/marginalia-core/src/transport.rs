//! Review server wire contract and HTTP transport.
//!
//! Every call is a form POST of `{api, review, <fields>}` to
//! `<server>/api/<api>`. The server answers with JSON carrying `errorCode`
//! (0 on success) and `errorMsg`. Two codes are produced locally:
//! [`TRANSPORT_FAILURE`] for connection errors and non-200 statuses, and
//! [`UNPARSABLE_BODY`] when the body is not the expected JSON.

use std::{future::Future, pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::model::{FetchedAnnotation, Mutation, Payload};

/// Local code for connection failures and non-200 responses.
pub const TRANSPORT_FAILURE: i64 = -1;
/// Local code for a response body that is not valid wire JSON.
pub const UNPARSABLE_BODY: i64 = 10_000;

/// API name of the fetch endpoint.
pub const LIST_COMMENTS: &str = "list-comments";

/// One request to the review server.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub api: String,
    pub review_id: String,
    pub fields: Payload,
}

impl ApiRequest {
    #[must_use]
    pub fn list_comments(review_id: &str) -> Self {
        Self {
            api: LIST_COMMENTS.to_string(),
            review_id: review_id.to_string(),
            fields: Payload::new(),
        }
    }

    #[must_use]
    pub fn for_mutation(review_id: &str, mutation: &Mutation) -> Self {
        Self {
            api: mutation.action.as_str().to_string(),
            review_id: review_id.to_string(),
            fields: mutation.payload.clone(),
        }
    }

    /// Form pairs in send order. Non-string values are sent as JSON text.
    #[must_use]
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("api".to_string(), self.api.clone()),
            ("review".to_string(), self.review_id.clone()),
        ];
        for (key, value) in &self.fields {
            let encoded = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            pairs.push((key.clone(), encoded));
        }
        pairs
    }
}

/// Review state reported by `list-comments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Open,
    Closed,
}

/// Parsed server response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiResponse {
    pub error_code: i64,
    pub error_msg: Option<String>,
    pub comments: Option<Vec<FetchedAnnotation>>,
    pub status: Option<ReviewState>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    error_code: Option<i64>,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    comments: Option<Vec<FetchedAnnotation>>,
    #[serde(default)]
    status: Option<ReviewState>,
}

impl ApiResponse {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(code: i64, msg: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_msg: Some(msg.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn transport_failure(msg: impl Into<String>) -> Self {
        Self::failure(TRANSPORT_FAILURE, msg)
    }

    /// Parse a 200 response body.
    #[must_use]
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<WireResponse>(body) {
            Ok(WireResponse {
                error_code: Some(error_code),
                error_msg,
                comments,
                status,
            }) => Self {
                error_code,
                error_msg,
                comments,
                status,
            },
            Ok(_) => Self::failure(UNPARSABLE_BODY, "response carries no errorCode"),
            Err(err) => Self::failure(
                UNPARSABLE_BODY,
                format!("failed to parse server-issued JSON: {err}"),
            ),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// Short description for outbox `last_error` and logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.error_msg {
            Some(msg) => format!("errorCode {}: {msg}", self.error_code),
            None => format!("errorCode {}", self.error_code),
        }
    }
}

/// Boxed future returned by a transport. It owns everything it needs so the
/// engine can keep it pending across other work.
pub type ApiFuture = Pin<Box<dyn Future<Output = ApiResponse> + Send + 'static>>;

/// Sends requests to the review server.
///
/// Implementations never fail: every problem is folded into the returned
/// [`ApiResponse`] as a nonzero `error_code`.
pub trait Transport {
    fn send(&self, request: ApiRequest) -> ApiFuture;
}

/// `ureq` transport run on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpTransport {
    #[must_use]
    pub fn new(base_url: &str, connect_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .user_agent(concat!("marginalia/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn endpoint(&self, api: &str) -> String {
        format!("{}/api/{api}", self.base_url)
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: ApiRequest) -> ApiFuture {
        let agent = self.agent.clone();
        let url = self.endpoint(&request.api);
        Box::pin(async move {
            let api = request.api.clone();
            let result =
                tokio::task::spawn_blocking(move || post_form(&agent, &url, &request)).await;
            match result {
                Ok(response) => {
                    debug!(api = %api, code = response.error_code, "server responded");
                    response
                }
                Err(err) => ApiResponse::transport_failure(format!("request task failed: {err}")),
            }
        })
    }
}

fn post_form(agent: &ureq::Agent, url: &str, request: &ApiRequest) -> ApiResponse {
    let pairs = request.form_pairs();
    let form: Vec<(&str, &str)> = pairs
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();

    match agent.post(url).send_form(&form) {
        Ok(resp) if resp.status() == 200 => match resp.into_string() {
            Ok(body) => ApiResponse::from_body(&body),
            Err(err) => ApiResponse::transport_failure(format!("read response body: {err}")),
        },
        Ok(resp) => ApiResponse::transport_failure(format!("HTTP {}", resp.status())),
        Err(ureq::Error::Status(code, _)) => ApiResponse::transport_failure(format!("HTTP {code}")),
        Err(err) => ApiResponse::transport_failure(format!("connection failed: {err}")),
    }
}
