use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors returned to callers of [`crate::RealtimeChannelClient`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("group id must not be empty")]
    EmptyGroupId,
    #[error("realtime channel client requires a running tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build channel authorizer: {0}")]
    Authorizer(#[from] AuthError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("app key must not be empty")]
    MissingAppKey,
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("auth response missing grant")]
    MissingGrant,
    #[error("no bearer token available")]
    MissingCredential,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),
    #[error("malformed connection_established payload: {0}")]
    MalformedConnectionPayload(String),
    #[error("malformed {event} payload: {reason}")]
    MalformedMessagePayload { event: String, reason: String },
}

impl ProtocolError {
    /// Only a broken connection handshake ends the session; everything else
    /// drops the offending frame.
    pub fn ends_session(&self) -> bool {
        matches!(self, ProtocolError::MalformedConnectionPayload(_))
    }
}

/// Why a single connection session ended. Never surfaced to callers; the
/// driver logs it and schedules a reconnect.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket connect failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("websocket connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket error: {0}")]
    Socket(#[source] tungstenite::Error),
    #[error("failed to send frame: {0}")]
    Send(#[source] tungstenite::Error),
    #[error("socket closed by server (code={code:?} reason={reason})")]
    ClosedByServer { code: Option<u16>, reason: String },
    #[error("socket stream ended")]
    StreamEnded,
    #[error("channel authorization failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server rejected connection (code={code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("server stopped answering keep-alive pings")]
    Unresponsive,
}
