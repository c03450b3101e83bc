//! Wire vocabulary shared by every connection.
//!
//! A typed [`Message`] travels as a flat JSON object
//! `{ id, metadata, type, method?, payload?, error? }`; the conversion goes
//! through [`WireMessage`] so the on-the-wire shape stays independent of the
//! Rust enum layout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::rpc_types::error::Error;

pub type CallId = uuid::Uuid;

pub fn new_call_id() -> CallId {
    uuid::Uuid::new_v4()
}

/// Context a transport attaches to every received message, e.g. which kind of
/// channel it came over and who sent it. Callers never fill this in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Serializable error produced by a remote method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(format!("Method '{}' not found.", method)).with_name("MethodNotFound")
    }

    pub fn invalid_arguments(err: impl std::fmt::Display) -> Self {
        Self::new(err.to_string()).with_name("InvalidArguments")
    }

    /// Accept whatever the peer put in `error`. An object with a string
    /// `message` keeps its fields; anything else is kept whole in `data`.
    pub fn from_value(value: Value) -> Self {
        if value.get("message").is_some_and(Value::is_string) {
            if let Ok(err) = serde_json::from_value::<RemoteError>(value.clone()) {
                return err;
            }
        }
        let message = match &value {
            Value::String(s) => s.clone(),
            Value::Null => "unknown remote error".to_owned(),
            other => other.to_string(),
        };
        Self::new(message).with_data(value)
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(&self).unwrap_or_else(|_| Value::String(self.message))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_name("SerdeError")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Opens a call. Always the first message of a `CallId`.
    Start { method: String, payload: Vec<Value> },
    /// One streamed item.
    Progress { payload: Value },
    /// Terminal message of a call.
    End(Result<Value, RemoteError>),
    Heartbeat,
    Cancel,
    /// A `type` this side does not understand. Routing drops it.
    Unknown,
}

impl MessageBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageBody::Start { .. } => "start",
            MessageBody::Progress { .. } => "progress",
            MessageBody::End(_) => "end",
            MessageBody::Heartbeat => "heartbeat",
            MessageBody::Cancel => "cancel",
            MessageBody::Unknown => "unknown",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, MessageBody::End(_))
    }
}

/// A message as handed to `Transportation::send`; metadata is only ever added
/// by the receiving transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct NoMetaMessage {
    pub id: CallId,
    pub body: MessageBody,
}

impl NoMetaMessage {
    pub fn new(id: CallId, body: MessageBody) -> Self {
        Self { id, body }
    }

    pub fn start(id: CallId, method: impl Into<String>, payload: Vec<Value>) -> Self {
        Self::new(
            id,
            MessageBody::Start {
                method: method.into(),
                payload,
            },
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(new_call_id(), MessageBody::Heartbeat)
    }

    pub fn with_metadata(self, metadata: Metadata) -> Message {
        Message {
            id: self.id,
            metadata,
            body: self.body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    pub id: CallId,
    pub metadata: Metadata,
    pub body: MessageBody,
}

impl Message {
    pub fn strip_metadata(self) -> NoMetaMessage {
        NoMetaMessage {
            id: self.id,
            body: self.body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Start,
    Progress,
    End,
    Heartbeat,
    Cancel,
    #[serde(other)]
    Unknown,
}

/// The flat JSON shape of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: CallId,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(rename = "type")]
    pub ty: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl WireMessage {
    fn from_parts(id: CallId, metadata: Metadata, body: MessageBody) -> Self {
        let mut wire = WireMessage {
            id,
            metadata,
            ty: MessageType::Heartbeat,
            method: None,
            payload: None,
            error: None,
        };
        match body {
            MessageBody::Start { method, payload } => {
                wire.ty = MessageType::Start;
                wire.method = Some(method);
                wire.payload = Some(Value::Array(payload));
            }
            MessageBody::Progress { payload } => {
                wire.ty = MessageType::Progress;
                wire.payload = Some(payload);
            }
            MessageBody::End(Ok(payload)) => {
                wire.ty = MessageType::End;
                wire.payload = (!payload.is_null()).then_some(payload);
            }
            MessageBody::End(Err(error)) => {
                wire.ty = MessageType::End;
                wire.error = Some(error.into_value());
            }
            MessageBody::Heartbeat => wire.ty = MessageType::Heartbeat,
            MessageBody::Cancel => wire.ty = MessageType::Cancel,
            MessageBody::Unknown => wire.ty = MessageType::Unknown,
        }
        wire
    }

    fn into_parts(self) -> Result<(CallId, Metadata, MessageBody), Error> {
        let body = match self.ty {
            MessageType::Start => {
                let method = self.method.ok_or_else(|| {
                    Error::MalformedMessage(format!("start message {} has no method", self.id))
                })?;
                let payload = match self.payload {
                    None | Some(Value::Null) => vec![],
                    Some(Value::Array(args)) => args,
                    Some(other) => {
                        return Err(Error::MalformedMessage(format!(
                            "start message {} has non-array payload: {}",
                            self.id, other
                        )))
                    }
                };
                MessageBody::Start { method, payload }
            }
            MessageType::Progress => MessageBody::Progress {
                payload: self.payload.unwrap_or(Value::Null),
            },
            MessageType::End => match self.error {
                Some(error) => MessageBody::End(Err(RemoteError::from_value(error))),
                None => MessageBody::End(Ok(self.payload.unwrap_or(Value::Null))),
            },
            MessageType::Heartbeat => MessageBody::Heartbeat,
            MessageType::Cancel => MessageBody::Cancel,
            MessageType::Unknown => MessageBody::Unknown,
        };
        Ok((self.id, self.metadata, body))
    }
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        WireMessage::from_parts(msg.id, msg.metadata, msg.body)
    }
}

impl From<NoMetaMessage> for WireMessage {
    fn from(msg: NoMetaMessage) -> Self {
        WireMessage::from_parts(msg.id, Metadata::default(), msg.body)
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let (id, metadata, body) = wire.into_parts()?;
        Ok(Message { id, metadata, body })
    }
}

impl TryFrom<WireMessage> for NoMetaMessage {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let (id, _, body) = wire.into_parts()?;
        Ok(NoMetaMessage { id, body })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn sample_metadata() -> Metadata {
        let mut extra = serde_json::Map::new();
        extra.insert("tab_id".to_string(), json!(7));
        Metadata {
            tunnel_type: Some("ring".to_string()),
            sender: Some("content-script".to_string()),
            extra,
        }
    }

    #[rstest]
    #[case::start(MessageBody::Start { method: "translate".into(), payload: vec![json!("hi"), json!({"to": "fr"})] })]
    #[case::start_no_args(MessageBody::Start { method: "ping".into(), payload: vec![] })]
    #[case::progress(MessageBody::Progress { payload: json!([1, 2]) })]
    #[case::progress_null(MessageBody::Progress { payload: Value::Null })]
    #[case::end_ok(MessageBody::End(Ok(json!("pong"))))]
    #[case::end_empty(MessageBody::End(Ok(Value::Null)))]
    #[case::end_err(MessageBody::End(Err(RemoteError::new("boom").with_name("Error").with_data(json!({"code": 3})))))]
    #[case::heartbeat(MessageBody::Heartbeat)]
    #[case::cancel(MessageBody::Cancel)]
    fn body_survives_wire_encoding(#[case] body: MessageBody) {
        let msg = Message {
            id: new_call_id(),
            metadata: sample_metadata(),
            body,
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn wire_shape_is_flat() {
        let id = new_call_id();
        let value = serde_json::to_value(NoMetaMessage::start(id, "ping", vec![])).unwrap();
        assert_eq!(
            value,
            json!({ "id": id.to_string(), "metadata": {}, "type": "start", "method": "ping", "payload": [] })
        );

        let value =
            serde_json::to_value(NoMetaMessage::new(id, MessageBody::End(Ok(Value::Null)))).unwrap();
        assert_eq!(
            value,
            json!({ "id": id.to_string(), "metadata": {}, "type": "end" })
        );
    }

    #[test]
    fn end_with_error_wins_over_payload() {
        let id = new_call_id();
        let msg: Message = serde_json::from_value(json!({
            "id": id.to_string(),
            "type": "end",
            "payload": 1,
            "error": { "message": "nope" },
        }))
        .unwrap();
        assert_eq!(msg.body, MessageBody::End(Err(RemoteError::new("nope"))));
        assert_eq!(msg.metadata, Metadata::default());
    }

    #[test]
    fn malformed_messages_are_rejected() {
        let id = new_call_id().to_string();
        assert!(
            serde_json::from_value::<Message>(json!({ "id": id, "type": "start" })).is_err()
        );
        assert!(serde_json::from_value::<Message>(
            json!({ "id": id, "type": "start", "method": "m", "payload": 3 })
        )
        .is_err());
        assert!(serde_json::from_value::<Message>(json!({ "id": "nope", "type": "cancel" })).is_err());
    }

    #[test]
    fn unrecognized_type_decodes_as_unknown() {
        let id = new_call_id();
        let msg: Message =
            serde_json::from_value(json!({ "id": id.to_string(), "type": "shout", "payload": 1 }))
                .unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.body, MessageBody::Unknown);
    }

    #[rstest]
    #[case::string(json!("boom"), "boom")]
    #[case::number(json!(42), "42")]
    #[case::array(json!(["a", 1]), "[\"a\",1]")]
    #[case::object_without_message(json!({ "code": 3 }), "{\"code\":3}")]
    fn any_error_value_is_accepted(#[case] error: Value, #[case] message: &str) {
        let id = new_call_id();
        let msg: Message = serde_json::from_value(json!({
            "id": id.to_string(),
            "type": "end",
            "error": error.clone(),
        }))
        .unwrap();
        let MessageBody::End(Err(remote)) = msg.body else {
            panic!("expected an error end, got {:?}", msg.body);
        };
        assert_eq!(remote.name, None);
        assert_eq!(remote.message, message);
        assert_eq!(remote.data, Some(error));

        // re-encoded as a structured error object
        let text = serde_json::to_string(&NoMetaMessage::new(id, MessageBody::End(Err(remote.clone()))))
            .unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back.body, MessageBody::End(Err(remote)));
    }

    #[test]
    fn structured_error_keeps_its_fields() {
        let remote = RemoteError::from_value(json!({
            "name": "TypeError",
            "message": "x is not a function",
            "data": { "line": 3 },
        }));
        assert_eq!(
            remote,
            RemoteError::new("x is not a function")
                .with_name("TypeError")
                .with_data(json!({ "line": 3 }))
        );
    }

    #[test]
    fn remote_error_display() {
        assert_eq!(
            RemoteError::method_not_found("doesNotExist").to_string(),
            "MethodNotFound: Method 'doesNotExist' not found."
        );
        assert_eq!(RemoteError::new("plain").to_string(), "plain");
    }
}
