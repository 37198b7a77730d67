//! HTTP transport: POST each scan as JSON and classify the reply.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::error::Error as _;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{Submission, Transport, TransientKind};
use crate::config::secrets::{ExposeSecret, SecretString};
use crate::error::{Error, Result};
use crate::model::{ScanMode, WorkItem};

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    token: Option<SecretString>,
}

/// Wire shape of a submitted scan.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScanRecord<'a> {
    id: Uuid,
    code: &'a str,
    mode: ScanMode,
    created_at: DateTime<Utc>,
    retry_count: u32,
}

/// Acknowledgement body. Only `"success": true` confirms delivery.
#[derive(Debug, Deserialize)]
struct Ack {
    success: Option<bool>,
}

impl HttpTransport {
    /// `timeout` bounds each request on the client side as well; the worker
    /// applies its own deadline on top.
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, item: &WorkItem) -> Submission {
        let record = ScanRecord {
            id: item.id.0,
            code: &item.code,
            mode: item.mode,
            created_at: item.created_at,
            retry_count: item.retry_count,
        };

        let mut request = self.client.post(&self.endpoint).json(&record);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let submission = match request.send().await {
            Ok(response) => {
                let status = response.status();
                match response.bytes().await {
                    Ok(body) => classify_response(status, &body),
                    Err(e) => classify_error(&e),
                }
            }
            Err(e) => classify_error(&e),
        };
        debug!(id = %item.id, outcome = submission.label(), "http submit");
        submission
    }
}

/// Classify an HTTP reply.
///
/// A 2xx only counts as delivered with a JSON ack carrying `"success": true`.
/// Any other 2xx body was not confirmed by the endpoint and is retried.
pub fn classify_response(status: StatusCode, body: &[u8]) -> Submission {
    if status.is_success() {
        return match serde_json::from_slice::<Ack>(body).map(|ack| ack.success) {
            Ok(Some(true)) => Submission::Success,
            Ok(Some(false)) => Submission::Permanent {
                code: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
            },
            Ok(None) | Err(_) => Submission::Transient {
                kind: TransientKind::Network,
            },
        };
    }
    match status {
        StatusCode::REQUEST_TIMEOUT => Submission::Transient {
            kind: TransientKind::Timeout,
        },
        StatusCode::TOO_MANY_REQUESTS => Submission::Transient {
            kind: TransientKind::Server5xx,
        },
        s if s.is_client_error() => Submission::Permanent { code: s.as_u16() },
        s if s.is_server_error() => Submission::Transient {
            kind: TransientKind::Server5xx,
        },
        _ => Submission::Transient {
            kind: TransientKind::Network,
        },
    }
}

/// Classify a request that never produced a complete reply.
fn classify_error(e: &reqwest::Error) -> Submission {
    let kind = if e.is_timeout() {
        TransientKind::Timeout
    } else if is_name_resolution(e) {
        TransientKind::Dns
    } else {
        TransientKind::Network
    };
    Submission::Transient { kind }
}

/// A connect failure whose I/O cause never reached a socket, i.e. the
/// resolver gave up before any address was dialled.
fn is_name_resolution(e: &reqwest::Error) -> bool {
    if !e.is_connect() {
        return false;
    }
    let mut io_causes = std::iter::successors(e.source(), |&cause| cause.source())
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .peekable();
    io_causes.peek().is_some() && io_causes.all(|io| !is_socket_error(io.kind()))
}

fn is_socket_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrInUse
            | ErrorKind::AddrNotAvailable
            | ErrorKind::TimedOut
            | ErrorKind::PermissionDenied
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::NetworkDown
    )
}
