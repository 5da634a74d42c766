//! JSON wire protocol between authors and the sync server.
//!
//! Every frame is a WebSocket text message:
//! ```text
//! { "type": "<event>", "data": <payload> }
//!
//! client → server: join · submitChange · changeAuthor · disconnect · logEvent
//! server → client: registered · authorChange · initDoc · newChange · authorDisconnect · error
//! ```
//!
//! Connection lifecycle:
//! ```text
//! Connecting ──join──► Authenticated ──initDoc──► Synced ──disconnect──► Disconnected
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_core::{AuthorId, Change, Version};

use crate::session::AuthorData;

/// Event names accepted from clients.
const CLIENT_EVENTS: &[&str] = &["join", "submitChange", "changeAuthor", "disconnect", "logEvent"];

/// Handshake parameters sent as the first frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub doc_name: String,
    /// Present when resuming as an existing author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<AuthorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Version the client already holds; history before it is not resent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_height: Option<Version>,
}

impl JoinRequest {
    pub fn new(doc_name: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            ..Self::default()
        }
    }

    pub fn resume(doc_name: impl Into<String>, author_id: AuthorId, token: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            author_id: Some(author_id),
            token: Some(token.into()),
            start_height: None,
        }
    }
}

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Join(JoinRequest),
    SubmitChange(Change),
    ChangeAuthor(AuthorData),
    Disconnect,
    /// Opaque client telemetry
    LogEvent(serde_json::Value),
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "join",
            ClientEvent::SubmitChange(_) => "submitChange",
            ClientEvent::ChangeAuthor(_) => "changeAuthor",
            ClientEvent::Disconnect => "disconnect",
            ClientEvent::LogEvent(_) => "logEvent",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a frame. Unknown event names are reported as such rather
    /// than as a generic decode failure.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
        }

        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if !CLIENT_EVENTS.contains(&envelope.kind.as_str()) {
            return Err(ProtocolError::UnknownMessageType(envelope.kind));
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Unicast: identity of the connecting author
    #[serde(rename_all = "camelCase")]
    Registered { author_id: AuthorId, token: String },
    /// Broadcast: an author joined or changed display data
    #[serde(rename_all = "camelCase")]
    AuthorChange {
        author_id: AuthorId,
        author_data: AuthorData,
    },
    /// Unicast: history since the client's start height plus active authors
    InitDoc {
        history: Change,
        authors: BTreeMap<AuthorId, AuthorData>,
    },
    /// Broadcast: newly committed transactions
    NewChange(Change),
    /// Broadcast: an author left
    AuthorDisconnect(AuthorId),
    /// Unicast: fatal protocol error, sent before the connection is dropped
    Error(String),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Registered { .. } => "registered",
            ServerEvent::AuthorChange { .. } => "authorChange",
            ServerEvent::InitDoc { .. } => "initDoc",
            ServerEvent::NewChange(_) => "newChange",
            ServerEvent::AuthorDisconnect(_) => "authorDisconnect",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Outbound fan-out supplied by the transport.
///
/// Both calls are non-blocking and never fail from the caller's point of
/// view; a transport that cannot deliver drops the peer instead.
pub trait Broadcaster: Send + Sync {
    /// Send to every connection on the document.
    fn broadcast(&self, event: &ServerEvent);
    /// Send to the connection this broadcaster was built for.
    fn send_to_author(&self, event: &ServerEvent);
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Synced,
    Disconnected,
}

impl ConnectionState {
    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(self, next: ConnectionState) -> Result<ConnectionState, ProtocolError> {
        use ConnectionState::*;
        match (self, next) {
            (Connecting, Authenticated) | (Authenticated, Synced) => Ok(next),
            (Disconnected, _) => Err(ProtocolError::InvalidTransition { from: self, to: next }),
            (_, Disconnected) => Ok(next),
            _ => Err(ProtocolError::InvalidTransition { from: self, to: next }),
        }
    }

    /// Whether a client event is legal in this state.
    pub fn accepts(&self, event: &ClientEvent) -> bool {
        match self {
            ConnectionState::Connecting => matches!(event, ClientEvent::Join(_)),
            ConnectionState::Synced => !matches!(event, ClientEvent::Join(_)),
            ConnectionState::Authenticated | ConnectionState::Disconnected => false,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Event name not part of the protocol; fatal to the connection
    UnknownMessageType(String),
    /// Event not legal in the current connection state
    UnexpectedEvent {
        state: ConnectionState,
        event: &'static str,
    },
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownMessageType(t) => write!(f, "Unknown message type '{t}'"),
            Self::UnexpectedEvent { state, event } => {
                write!(f, "Event '{event}' not allowed in state {state:?}")
            }
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid connection transition {from:?} -> {to:?}")
            }
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{text_items, Transaction};

    #[test]
    fn test_join_wire_shape() {
        let text = r#"{"type":"join","data":{"docName":"Foo","authorId":3,"token":"ab","startHeight":2}}"#;
        let event = ClientEvent::decode(text).unwrap();
        assert_eq!(
            event,
            ClientEvent::Join(JoinRequest {
                doc_name: "Foo".into(),
                author_id: Some(3),
                token: Some("ab".into()),
                start_height: Some(2),
            })
        );
    }

    #[test]
    fn test_join_optional_fields() {
        let event = ClientEvent::decode(r#"{"type":"join","data":{"docName":"Foo"}}"#).unwrap();
        assert_eq!(event, ClientEvent::Join(JoinRequest::new("Foo")));
    }

    #[test]
    fn test_submit_change_roundtrip() {
        let tx = Transaction::insertion(0, 0, text_items("hi")).unwrap();
        let event = ClientEvent::SubmitChange(Change::new(4, vec![tx]));
        let decoded = ClientEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.kind(), "submitChange");
    }

    #[test]
    fn test_disconnect_without_data() {
        assert_eq!(
            ClientEvent::decode(r#"{"type":"disconnect"}"#).unwrap(),
            ClientEvent::Disconnect
        );
    }

    #[test]
    fn test_log_event_is_opaque() {
        let event = ClientEvent::decode(r#"{"type":"logEvent","data":{"kind":"paste","size":12}}"#).unwrap();
        match event {
            ClientEvent::LogEvent(value) => assert_eq!(value["size"], 12),
            other => panic!("Expected logEvent, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_message_type() {
        assert_eq!(
            ClientEvent::decode(r#"{"type":"rewriteHistory","data":{}}"#),
            Err(ProtocolError::UnknownMessageType("rewriteHistory".into()))
        );
        assert!(matches!(
            ClientEvent::decode("not json"),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_server_event_wire_shape() {
        let json = ServerEvent::Registered {
            author_id: 7,
            token: "t".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(json, r#"{"type":"registered","data":{"authorId":7,"token":"t"}}"#);

        let json = ServerEvent::AuthorDisconnect(7).encode().unwrap();
        assert_eq!(json, r#"{"type":"authorDisconnect","data":7}"#);

        let event = ServerEvent::AuthorChange {
            author_id: 2,
            author_data: AuthorData {
                name: "Ann".into(),
                color: "ff0000".into(),
            },
        };
        let json = event.encode().unwrap();
        assert!(json.contains(r#""authorData":{"name":"Ann","color":"ff0000"}"#));
        assert_eq!(ServerEvent::decode(&json).unwrap(), event);
    }

    #[test]
    fn test_init_doc_roundtrip() {
        let mut authors = BTreeMap::new();
        authors.insert(1, AuthorData::default());
        let event = ServerEvent::InitDoc {
            history: Change::empty(0),
            authors,
        };
        assert_eq!(ServerEvent::decode(&event.encode().unwrap()).unwrap(), event);
    }

    #[test]
    fn test_connection_lifecycle() {
        use ConnectionState::*;
        let state = Connecting.advance(Authenticated).unwrap();
        let state = state.advance(Synced).unwrap();
        let state = state.advance(Disconnected).unwrap();
        assert!(state.advance(Synced).is_err());
        assert!(Connecting.advance(Synced).is_err());
        assert!(Synced.advance(Authenticated).is_err());
        assert_eq!(Connecting.advance(Disconnected), Ok(Disconnected));
    }

    #[test]
    fn test_state_accepts() {
        let join = ClientEvent::Join(JoinRequest::new("d"));
        assert!(ConnectionState::Connecting.accepts(&join));
        assert!(!ConnectionState::Connecting.accepts(&ClientEvent::Disconnect));
        assert!(ConnectionState::Synced.accepts(&ClientEvent::Disconnect));
        assert!(!ConnectionState::Synced.accepts(&join));
        assert!(!ConnectionState::Disconnected.accepts(&ClientEvent::Disconnect));
    }
}
