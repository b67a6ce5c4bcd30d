use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CorrelationId, EndpointKey};
use crate::error::{AgentError, Result};

/// Local target for `octo_api` calls when the relay sends no `baseURL`
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:58888";

/// Envelope as it arrives from the relay, before the payload is looked at
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<CorrelationId>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Requests the relay can make of the agent (Relay -> Agent)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    OctoApi(ApiRequest),
    WsInit {
        #[serde(rename = "wsEndpointUrl")]
        ws_endpoint_url: EndpointKey,
    },
    WsSend {
        #[serde(rename = "wsEndpointUrl")]
        ws_endpoint_url: EndpointKey,
        message: Value,
    },
    WsClose {
        #[serde(rename = "wsEndpointUrl")]
        ws_endpoint_url: EndpointKey,
    },
}

impl RelayRequest {
    /// Discriminants this agent understands; anything else is ignored
    pub const KINDS: [&'static str; 4] = ["octo_api", "ws_init", "ws_send", "ws_close"];
}

/// A proxied HTTP call against a local service
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiRequest {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(rename = "baseURL", default)]
    pub base_url: Option<String>,
}

impl ApiRequest {
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL)
    }

    pub fn path(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }
}

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Request {
        id: Option<CorrelationId>,
        request: RelayRequest,
    },
    /// Missing or unrecognized `payload.type`
    Ignored { kind: Option<String> },
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_str(text)?;

        let payload = match raw.payload {
            Some(Value::Object(payload)) => payload,
            Some(_) => return Err(AgentError::Protocol("payload is not an object".into())),
            None => return Err(AgentError::Protocol("missing payload".into())),
        };

        let kind = match payload.get("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind.clone(),
            Some(Value::String(_)) | Some(Value::Null) | None => {
                return Ok(InboundFrame::Ignored { kind: None })
            }
            Some(other) => {
                return Ok(InboundFrame::Ignored {
                    kind: Some(other.to_string()),
                })
            }
        };

        if !RelayRequest::KINDS.contains(&kind.as_str()) {
            return Ok(InboundFrame::Ignored { kind: Some(kind) });
        }

        let request = serde_json::from_value(Value::Object(payload))?;
        Ok(InboundFrame::Request { id: raw.id, request })
    }
}

/// Messages sent to the relay (Agent -> Relay)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
        response: ApiOutcome,
        #[serde(rename = "isError", skip_serializing_if = "is_false")]
        is_error: bool,
    },
    WsInitResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
        response: SessionReport,
        #[serde(rename = "wsEndpointUrl")]
        ws_endpoint_url: EndpointKey,
    },
    WsResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
        response: WsReply,
        #[serde(rename = "wsEndpointUrl")]
        ws_endpoint_url: EndpointKey,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Result of one proxied HTTP call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ApiOutcome {
    Data { data: Value },
    Failure(ApiFailure),
}

/// Error description for a failed HTTP call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Event of a multiplexed local session as reported to the relay
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SessionReport {
    Open {
        open: bool,
    },
    Close {
        close: bool,
    },
    Error {
        error: String,
    },
    Data {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
    },
}

impl SessionReport {
    pub fn opened() -> Self {
        SessionReport::Open { open: true }
    }

    pub fn closed() -> Self {
        SessionReport::Close { close: true }
    }

    pub fn error(error: impl Into<String>) -> Self {
        SessionReport::Error {
            error: error.into(),
        }
    }

    pub fn frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(data) => SessionReport::Data {
                data,
                encoding: None,
            },
            Frame::Binary(bytes) => SessionReport::Data {
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
                encoding: Some("base64".to_string()),
            },
        }
    }
}

/// Body of a `ws_response`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsReply {
    pub data: SessionReport,
}

impl OutgoingMessage {
    pub fn api_data(id: Option<CorrelationId>, data: Value) -> Self {
        OutgoingMessage::Response {
            id,
            response: ApiOutcome::Data { data },
            is_error: false,
        }
    }

    pub fn api_failure(id: Option<CorrelationId>, failure: ApiFailure) -> Self {
        OutgoingMessage::Response {
            id,
            response: ApiOutcome::Failure(failure),
            is_error: true,
        }
    }

    pub fn session_event(
        id: Option<CorrelationId>,
        key: EndpointKey,
        response: SessionReport,
    ) -> Self {
        OutgoingMessage::WsInitResponse {
            id,
            response,
            ws_endpoint_url: key,
        }
    }

    /// Tells the relay there is no live session behind `key`
    pub fn endpoint_missing(id: Option<CorrelationId>, key: EndpointKey) -> Self {
        OutgoingMessage::WsResponse {
            id,
            response: WsReply {
                data: SessionReport::closed(),
            },
            ws_endpoint_url: key,
        }
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A single message on a local WebSocket session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Interprets the `message` of a `ws_send`.
    ///
    /// Strings go out as text. A byte array, or a serialized Node `Buffer`
    /// (`{"type":"Buffer","data":[...]}`), goes out as binary. Any other
    /// value is sent as its JSON text.
    pub fn from_relay(message: Value) -> Self {
        if let Value::String(text) = message {
            return Frame::Text(text);
        }

        match byte_array(&message) {
            Some(bytes) => Frame::Binary(bytes),
            None => Frame::Text(message.to_string()),
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }
}

fn byte_array(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("Buffer") => {
            map.get("data").and_then(byte_array)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_octo_api_with_defaults() {
        let frame = InboundFrame::parse(
            r#"{"id":"1","payload":{"type":"octo_api","method":"GET","url":"/status"}}"#,
        )
        .unwrap();

        let InboundFrame::Request { id, request } = frame else {
            panic!("expected a request");
        };
        assert_eq!(id, Some(CorrelationId::from("1")));

        let RelayRequest::OctoApi(api) = request else {
            panic!("expected octo_api");
        };
        assert_eq!(api.method(), "GET");
        assert_eq!(api.path(), "/status");
        assert_eq!(api.base_url(), DEFAULT_API_BASE_URL);
        assert_eq!(api.data, None);
    }

    #[test]
    fn test_parse_octo_api_without_id() {
        let frame =
            InboundFrame::parse(r#"{"payload":{"type":"octo_api","baseURL":"http://10.0.0.2:80"}}"#)
                .unwrap();

        match frame {
            InboundFrame::Request {
                id: None,
                request: RelayRequest::OctoApi(api),
            } => {
                assert_eq!(api.method(), "GET");
                assert_eq!(api.path(), "");
                assert_eq!(api.base_url(), "http://10.0.0.2:80");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ws_send() {
        let frame = InboundFrame::parse(
            r#"{"id":"7","payload":{"type":"ws_send","wsEndpointUrl":"ws://localhost:9000/x","message":"ping"}}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            InboundFrame::Request {
                id: Some("7".into()),
                request: RelayRequest::WsSend {
                    ws_endpoint_url: "ws://localhost:9000/x".into(),
                    message: json!("ping"),
                },
            }
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let frame = InboundFrame::parse(r#"{"id":"1","payload":{"type":"reboot"}}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Ignored {
                kind: Some("reboot".to_string())
            }
        );
    }

    #[test]
    fn test_missing_or_empty_type_is_ignored() {
        assert_eq!(
            InboundFrame::parse(r#"{"payload":{}}"#).unwrap(),
            InboundFrame::Ignored { kind: None }
        );
        assert_eq!(
            InboundFrame::parse(r#"{"payload":{"type":""}}"#).unwrap(),
            InboundFrame::Ignored { kind: None }
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(
            InboundFrame::parse("{not json"),
            Err(AgentError::Json(_))
        ));
        assert!(matches!(
            InboundFrame::parse("1700000000000"),
            Err(AgentError::Json(_))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"id":"1"}"#),
            Err(AgentError::Protocol(_))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"id":"1","payload":"ws_init"}"#),
            Err(AgentError::Protocol(_))
        ));
        // Recognized type with a missing required field
        assert!(matches!(
            InboundFrame::parse(r#"{"id":"1","payload":{"type":"ws_init"}}"#),
            Err(AgentError::Json(_))
        ));
    }

    #[test]
    fn test_api_data_shape() {
        let msg = OutgoingMessage::api_data(Some("1".into()), json!({"ok": true}));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({"type": "response", "id": "1", "response": {"data": {"ok": true}}})
        );
    }

    #[test]
    fn test_api_failure_sets_is_error() {
        let msg = OutgoingMessage::api_failure(
            Some("2".into()),
            ApiFailure {
                message: "Request failed with status code 500".to_string(),
                code: Some("ERR_BAD_RESPONSE".to_string()),
                status: Some(500),
                data: None,
            },
        );
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "response");
        assert_eq!(value["isError"], true);
        assert_eq!(value["response"]["status"], 500);
        assert_eq!(value["response"]["code"], "ERR_BAD_RESPONSE");
        assert!(value["response"].get("data").is_none());
    }

    #[test]
    fn test_session_event_without_id_omits_it() {
        let msg = OutgoingMessage::session_event(
            None,
            "ws://localhost:9000/x".into(),
            SessionReport::closed(),
        );
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "ws_init_response",
                "response": {"close": true},
                "wsEndpointUrl": "ws://localhost:9000/x"
            })
        );
    }

    #[test]
    fn test_endpoint_missing_shape() {
        let msg = OutgoingMessage::endpoint_missing(Some("3".into()), "ws://a/b".into());
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "ws_response",
                "id": "3",
                "response": {"data": {"close": true}},
                "wsEndpointUrl": "ws://a/b"
            })
        );
    }

    #[test]
    fn test_binary_frame_report_is_base64() {
        let report = SessionReport::frame(Frame::Binary(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({"data": "3q2+7w==", "encoding": "base64"})
        );
    }

    #[test]
    fn test_frame_from_relay() {
        assert_eq!(Frame::from_relay(json!("ping")), Frame::Text("ping".to_string()));
        assert_eq!(Frame::from_relay(json!([1, 2, 255])), Frame::Binary(vec![1, 2, 255]));
        assert_eq!(
            Frame::from_relay(json!({"type": "Buffer", "data": [104, 105]})),
            Frame::Binary(b"hi".to_vec())
        );
        // Out-of-range numbers are not bytes
        assert_eq!(Frame::from_relay(json!([1, 300])), Frame::Text("[1,300]".to_string()));
        assert_eq!(
            Frame::from_relay(json!({"op": "subscribe"})),
            Frame::Text(r#"{"op":"subscribe"}"#.to_string())
        );
    }

    #[test]
    fn test_numeric_id_is_echoed_unchanged() {
        let frame = InboundFrame::parse(
            r#"{"id":42,"payload":{"type":"octo_api","url":"/status"}}"#,
        )
        .unwrap();
        let InboundFrame::Request { id, .. } = frame else {
            panic!("expected a request");
        };
        assert_eq!(id.as_ref().map(ToString::to_string).as_deref(), Some("42"));

        let msg = OutgoingMessage::api_data(id, json!({"ok": true}));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "response", "id": 42, "response": {"data": {"ok": true}}})
        );
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(Frame::Text("pong".to_string()).size(), 4);
        assert_eq!(Frame::Binary(vec![0; 16]).size(), 16);
    }
}
