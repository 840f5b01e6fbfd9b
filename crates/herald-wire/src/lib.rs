use herald_types::{IncomingNotification, NotificationType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Path of the notification socket relative to the service base URL.
pub const NOTIFICATION_PATH: &str = "/ws/notifications";
/// Query parameter carrying the bearer token.
pub const TOKEN_PARAM: &str = "token";
/// WebSocket close code for an intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// WebSocket close code reported when a connection drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A regular notification.
    Notification(IncomingNotification),
    /// A service-wide announcement, already relabeled as [`NotificationType::System`].
    SystemAnnouncement(IncomingNotification),
    /// Server-side unread badge push. The payload is opaque.
    BadgeUpdate(Option<Value>),
    /// Server-initiated heartbeat; must be answered with [`OutboundFrame::Pong`].
    Ping,
    /// A well-formed frame with a tag this client does not know.
    Unrecognized { tag: String },
}

/// Frames sent by the client.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Client heartbeat.
    Ping,
    /// Reply to a server heartbeat.
    Pong,
}

impl OutboundFrame {
    /// Encodes the frame as a JSON text message.
    pub fn encode(self) -> String {
        match self {
            OutboundFrame::Ping => r#"{"type":"ping"}"#.to_string(),
            OutboundFrame::Pong => r#"{"type":"pong"}"#.to_string(),
        }
    }
}

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text is not JSON or lacks a `type` tag.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The tag is known but its payload does not match.
    #[error("invalid {tag} payload: {source}")]
    Payload {
        /// Frame tag whose payload failed to decode.
        tag: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors produced while deriving the socket URL.
#[derive(Debug, Error)]
pub enum UrlError {
    /// The configured base URL does not parse.
    #[error("invalid base url: {0}")]
    Parse(#[from] url::ParseError),
    /// The base URL scheme has no socket equivalent.
    #[error("unsupported base url scheme `{0}`")]
    Scheme(String),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Decodes one JSON text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Malformed)?;

    match raw.tag.as_str() {
        "notification" => {
            let payload = raw.data.unwrap_or(Value::Null);
            let incoming = serde_json::from_value(payload).map_err(|source| FrameError::Payload {
                tag: "notification",
                source,
            })?;
            Ok(InboundFrame::Notification(incoming))
        }
        "system_announcement" => {
            let mut payload = raw.data.unwrap_or(Value::Null);
            if let Value::Object(fields) = &mut payload {
                fields.insert(
                    "type".to_string(),
                    Value::String(NotificationType::System.as_str().to_string()),
                );
            }
            let incoming = serde_json::from_value(payload).map_err(|source| FrameError::Payload {
                tag: "system_announcement",
                source,
            })?;
            Ok(InboundFrame::SystemAnnouncement(incoming))
        }
        "badge_update" => Ok(InboundFrame::BadgeUpdate(raw.data)),
        "ping" => Ok(InboundFrame::Ping),
        _ => Ok(InboundFrame::Unrecognized { tag: raw.tag }),
    }
}

/// Builds the socket URL from the service's HTTP(S) base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`. `path` is appended to any
/// path already on the base, and the token is added as a query parameter.
pub fn notification_socket_url(base: &str, path: &str, token: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(base)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(UrlError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| UrlError::Scheme(url.scheme().to_string()))?;
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut().append_pair(TOKEN_PARAM, token);

    Ok(url)
}
