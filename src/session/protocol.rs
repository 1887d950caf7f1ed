//! Session channel wire format
//!
//! The coordinator speaks Socket.IO v5 over an Engine.IO v4 websocket. Each
//! websocket text message is one Engine.IO frame:
//!
//! ```text
//! 0{"sid":..,"pingInterval":..}   open
//! 1                               close
//! 2 / 3                           ping / pong
//! 4<socket.io packet>             message
//! 6                               noop
//! ```
//!
//! A Socket.IO packet is `<type>[/nsp,][ack id][json]`. Only the default
//! namespace is used; binary attachments are not.

use serde::Deserialize;
use serde_json::Value;

use crate::error::NodeError;

/// Engine.IO handshake parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Message(Packet),
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Namespace connect; carries auth outbound and `{sid}` inbound
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

fn malformed(msg: impl Into<String>) -> NodeError {
    NodeError::Session(format!("Malformed frame: {}", msg.into()))
}

pub fn decode_frame(text: &str) -> Result<Frame, NodeError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or_else(|| malformed("empty"))?;
    let rest = chars.as_str();

    match kind {
        '0' => {
            let info: OpenInfo = serde_json::from_str(rest)
                .map_err(|e| malformed(format!("open payload: {}", e)))?;
            Ok(Frame::Open(info))
        }
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '4' => decode_packet(rest).map(Frame::Message),
        '6' => Ok(Frame::Noop),
        other => Err(malformed(format!("unknown frame type {:?}", other))),
    }
}

pub fn decode_packet(text: &str) -> Result<Packet, NodeError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or_else(|| malformed("empty packet"))?;
    let mut rest = chars.as_str();

    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(comma) => &rest[comma + 1..],
            None => "",
        };
    }

    let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    let id = if digits > 0 {
        Some(
            rest[..digits]
                .parse::<u64>()
                .map_err(|e| malformed(format!("ack id: {}", e)))?,
        )
    } else {
        None
    };
    let payload = &rest[digits..];

    let json = || -> Result<Value, NodeError> {
        serde_json::from_str(payload).map_err(|e| malformed(format!("payload: {}", e)))
    };

    match kind {
        '0' => {
            if payload.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(json()?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut items = match json()? {
                Value::Array(items) => items,
                _ => return Err(malformed("event payload is not an array")),
            };
            if items.is_empty() {
                return Err(malformed("event without a name"));
            }
            let name = match items.remove(0) {
                Value::String(name) => name,
                _ => return Err(malformed("event name is not a string")),
            };
            Ok(Packet::Event {
                id,
                name,
                args: items,
            })
        }
        '3' => {
            let id = id.ok_or_else(|| malformed("ack without id"))?;
            let args = match json()? {
                Value::Array(items) => items,
                _ => return Err(malformed("ack payload is not an array")),
            };
            Ok(Packet::Ack { id, args })
        }
        '4' => Ok(Packet::ConnectError(if payload.is_empty() {
            Value::Null
        } else {
            json()?
        })),
        '5' | '6' => Err(malformed("binary packets are not supported")),
        other => Err(malformed(format!("unknown packet type {:?}", other))),
    }
}

pub fn encode_frame(frame: &Frame) -> String {
    match frame {
        Frame::Open(info) => format!(
            "0{}",
            serde_json::json!({
                "sid": info.sid,
                "pingInterval": info.ping_interval,
                "pingTimeout": info.ping_timeout,
            })
        ),
        Frame::Close => "1".to_string(),
        Frame::Ping => "2".to_string(),
        Frame::Pong => "3".to_string(),
        Frame::Message(packet) => format!("4{}", encode_packet(packet)),
        Frame::Noop => "6".to_string(),
    }
}

pub fn encode_packet(packet: &Packet) -> String {
    match packet {
        Packet::Connect(None) => "0".to_string(),
        Packet::Connect(Some(auth)) => format!("0{}", auth),
        Packet::Disconnect => "1".to_string(),
        Packet::Event { id, name, args } => {
            let mut items = Vec::with_capacity(args.len() + 1);
            items.push(Value::String(name.clone()));
            items.extend(args.iter().cloned());
            let id = id.map(|id| id.to_string()).unwrap_or_default();
            format!("2{}{}", id, Value::Array(items))
        }
        Packet::Ack { id, args } => format!("3{}{}", id, Value::Array(args.clone())),
        Packet::ConnectError(data) => format!("4{}", data),
    }
}

/// Split acknowledgment args into the node-style `(error, result)` pair.
///
/// The coordinator acks with a single array argument, `3<id>[[err, result]]`;
/// flat `[err, result]` args are accepted as well. `Err` carries the error
/// message when `err` is non-null.
pub fn ack_result(args: &[Value]) -> Result<Value, String> {
    let pair = match args {
        [Value::Array(inner)] => inner.as_slice(),
        flat => flat,
    };
    match pair.first() {
        None | Some(Value::Null) => Ok(pair.get(1).cloned().unwrap_or(Value::Null)),
        Some(err) => Err(err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let frame = decode_frame(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Open(OpenInfo {
                sid: "abc".into(),
                ping_interval: 25000,
                ping_timeout: 20000,
            })
        );
    }

    #[test]
    fn test_decode_ack_with_error() {
        let frame = decode_frame(r#"4312[[{"message":"disabled"}]]"#).unwrap();
        let Frame::Message(Packet::Ack { id, args }) = frame else {
            panic!("expected ack");
        };
        assert_eq!(id, 12);
        assert_eq!(ack_result(&args), Err("disabled".to_string()));
    }

    #[test]
    fn test_decode_namespaced_event() {
        let frame = decode_frame(r#"42/admin,7["message","hi"]"#).unwrap();
        assert_eq!(
            frame,
            Frame::Message(Packet::Event {
                id: Some(7),
                name: "message".into(),
                args: vec![json!("hi")],
            })
        );
    }

    #[test]
    fn test_encode_event_with_ack_id() {
        let packet = Packet::Event {
            id: Some(3),
            name: "keep-alive".into(),
            args: vec![json!({"hits": 1})],
        };
        assert_eq!(
            encode_frame(&Frame::Message(packet)),
            r#"423["keep-alive",{"hits":1}]"#
        );
    }

    #[test]
    fn test_connect_with_auth() {
        let packet = Packet::Connect(Some(json!({"token": "t"})));
        assert_eq!(encode_packet(&packet), r#"0{"token":"t"}"#);
        assert_eq!(
            decode_frame(r#"40{"sid":"x"}"#).unwrap(),
            Frame::Message(Packet::Connect(Some(json!({"sid": "x"}))))
        );
        assert!(matches!(
            decode_frame(r#"44{"message":"Not authorized"}"#).unwrap(),
            Frame::Message(Packet::ConnectError(_))
        ));
    }

    #[test]
    fn test_ack_result_ok() {
        assert_eq!(ack_result(&[]), Ok(Value::Null));
        assert_eq!(ack_result(&[Value::Null, json!(true)]), Ok(json!(true)));
        assert_eq!(ack_result(&[json!("boom")]), Err("\"boom\"".to_string()));
    }

    #[test]
    fn test_ack_result_unpacks_single_array_arg() {
        let frame = decode_frame(r#"435[[null,true]]"#).unwrap();
        let Frame::Message(Packet::Ack { id, args }) = frame else {
            panic!("expected ack");
        };
        assert_eq!(id, 5);
        assert_eq!(ack_result(&args), Ok(json!(true)));

        let cert = [json!([null, {"cert": "C", "key": "K"}])];
        assert_eq!(ack_result(&cert), Ok(json!({"cert": "C", "key": "K"})));
        assert_eq!(ack_result(&[json!([null])]), Ok(Value::Null));
        assert_eq!(ack_result(&[json!(["boom"])]), Err("\"boom\"".to_string()));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode_frame("").is_err());
        assert!(decode_frame("9").is_err());
        assert!(decode_frame("42{}").is_err());
        assert!(decode_frame("43[]").is_err());
        assert!(decode_frame("451-[\"bin\"]").is_err());
    }
}
