//! Message shapes exchanged between participants and the simulation server
//!
//! The records are duck-typed JSON on the wire; here they are decoded once,
//! at the boundary, into tagged enums so the rest of the code never sniffs
//! for fields again.

use crate::codec::WireMessage;
use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method name of server-pushed tick notifications
pub const TICK_METHOD: &str = "tick";
/// Method name of per-tick command batches
pub const MUTATIONS_METHOD: &str = "mutations";

/// One action submitted for a tick, e.g. `steer` with a force vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Command {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Records sent by a participant to the server
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Mandatory first record of every connection
    Handshake { agent: String, greeting: String },
    /// Ad-hoc request expecting a response with the same id
    Request {
        agent: String,
        request_id: u64,
        method: String,
        arguments: Vec<Value>,
    },
    /// The command batch for one tick; never acknowledged
    Mutations {
        agent: String,
        tick: u64,
        commands: Vec<Command>,
    },
}

impl OutboundMessage {
    /// Handshake with the default greeting
    pub fn handshake(agent: impl Into<String>) -> Self {
        let agent = agent.into();
        let greeting = format!("hello from {} !", agent);
        Self::Handshake { agent, greeting }
    }

    pub fn agent(&self) -> &str {
        match self {
            Self::Handshake { agent, .. }
            | Self::Request { agent, .. }
            | Self::Mutations { agent, .. } => agent,
        }
    }
}

/// Records sent by the server to a participant
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response { request_id: u64, results: Value },
    Push { method: String, arguments: Vec<Value> },
}

impl InboundMessage {
    pub fn response(request_id: u64, results: Value) -> Self {
        Self::Response {
            request_id,
            results,
        }
    }

    pub fn tick(tick: u64, snapshot: Value) -> Self {
        Self::Push {
            method: TICK_METHOD.to_string(),
            arguments: vec![Value::from(tick), snapshot],
        }
    }

    /// Interprets the message as a tick notification.
    ///
    /// Pushes of any other method are `UnknownMethod`; responses are not
    /// ticks at all and are reported as `InvalidMessage`.
    pub fn into_tick(self) -> Result<TickNotification> {
        match self {
            Self::Push { method, arguments } if method == TICK_METHOD => {
                TickNotification::from_arguments(arguments)
            }
            Self::Push { method, .. } => Err(ProtocolError::UnknownMethod(method)),
            Self::Response { request_id, .. } => Err(ProtocolError::InvalidMessage(format!(
                "expected a tick push, got response {}",
                request_id
            ))),
        }
    }
}

/// A server-initiated tick: its index and the participant's view of the world
#[derive(Debug, Clone, PartialEq)]
pub struct TickNotification {
    pub tick: u64,
    pub snapshot: Value,
}

impl TickNotification {
    /// Parses `[tickIndex, worldSnapshot]`.
    ///
    /// The index may be a JSON number or a numeric string. A missing
    /// snapshot is `null`.
    pub fn from_arguments(arguments: Vec<Value>) -> Result<Self> {
        let mut arguments = arguments.into_iter();

        let tick = match arguments.next() {
            Some(Value::Number(number)) => number.as_u64(),
            Some(Value::String(text)) => text.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            ProtocolError::InvalidMessage("tick push without a valid tick index".to_string())
        })?;

        Ok(Self {
            tick,
            snapshot: arguments.next().unwrap_or(Value::Null),
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HandshakeFrame {
    agent: String,
    handshake: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestFrame {
    agent: String,
    method: String,
    #[serde(default)]
    arguments: Vec<Value>,
    request_id: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallFrame {
    agent: String,
    method: String,
    #[serde(default)]
    arguments: Vec<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseFrame {
    request_id: u64,
    #[serde(default)]
    results: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PushFrame {
    method: String,
    #[serde(default)]
    arguments: Vec<Value>,
}

fn encode_error(err: serde_json::Error) -> ProtocolError {
    ProtocolError::Encode(err.to_string())
}

pub(crate) fn shape<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidMessage(format!("bad {}: {}", what, e)))
}

/// Field presence of a record, or `InvalidMessage` when it is not an object
pub(crate) fn has_fields<const N: usize>(value: &Value, fields: [&str; N]) -> Result<[bool; N]> {
    match value {
        Value::Object(object) => Ok(fields.map(|field| object.contains_key(field))),
        other => Err(ProtocolError::InvalidMessage(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

impl WireMessage for OutboundMessage {
    fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Handshake { agent, greeting } => serde_json::to_value(HandshakeFrame {
                agent: agent.clone(),
                handshake: greeting.clone(),
            }),
            Self::Request {
                agent,
                request_id,
                method,
                arguments,
            } => serde_json::to_value(RequestFrame {
                agent: agent.clone(),
                method: method.clone(),
                arguments: arguments.clone(),
                request_id: *request_id,
            }),
            Self::Mutations {
                agent,
                tick,
                commands,
            } => {
                let commands = serde_json::to_value(commands).map_err(encode_error)?;
                serde_json::to_value(CallFrame {
                    agent: agent.clone(),
                    method: MUTATIONS_METHOD.to_string(),
                    arguments: vec![Value::from(*tick), commands],
                })
            }
        };

        value.map_err(encode_error)
    }

    fn from_value(value: Value) -> Result<Self> {
        let [has_handshake, has_request_id] = has_fields(&value, ["Handshake", "RequestId"])?;

        if has_handshake {
            let frame: HandshakeFrame = shape(value, "handshake")?;
            return Ok(Self::Handshake {
                agent: frame.agent,
                greeting: frame.handshake,
            });
        }

        if has_request_id {
            let frame: RequestFrame = shape(value, "request")?;
            return Ok(Self::Request {
                agent: frame.agent,
                request_id: frame.request_id,
                method: frame.method,
                arguments: frame.arguments,
            });
        }

        let frame: CallFrame = shape(value, "mutation batch")?;
        if frame.method != MUTATIONS_METHOD {
            return Err(ProtocolError::InvalidMessage(format!(
                "method {:?} sent without a request id",
                frame.method
            )));
        }

        let mut arguments = frame.arguments.into_iter();
        let tick = arguments.next().and_then(|v| v.as_u64()).ok_or_else(|| {
            ProtocolError::InvalidMessage("mutation batch without a tick index".to_string())
        })?;

        let commands = match arguments.next() {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(|item| shape(item, "command"))
                .collect::<Result<Vec<Command>>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "mutation list must be an array, got {}",
                    other
                )))
            }
        };

        Ok(Self::Mutations {
            agent: frame.agent,
            tick,
            commands,
        })
    }
}

impl WireMessage for InboundMessage {
    fn to_value(&self) -> Result<Value> {
        let value = match self {
            Self::Response {
                request_id,
                results,
            } => serde_json::to_value(ResponseFrame {
                request_id: *request_id,
                results: results.clone(),
            }),
            Self::Push { method, arguments } => serde_json::to_value(PushFrame {
                method: method.clone(),
                arguments: arguments.clone(),
            }),
        };

        value.map_err(encode_error)
    }

    fn from_value(value: Value) -> Result<Self> {
        let [has_request_id, has_method] = has_fields(&value, ["RequestId", "Method"])?;

        if has_request_id {
            let frame: ResponseFrame = shape(value, "response")?;
            Ok(Self::Response {
                request_id: frame.request_id,
                results: frame.results,
            })
        } else if has_method {
            let frame: PushFrame = shape(value, "push")?;
            Ok(Self::Push {
                method: frame.method,
                arguments: frame.arguments,
            })
        } else {
            Err(ProtocolError::InvalidMessage(format!(
                "record has neither RequestId nor Method: {}",
                value
            )))
        }
    }
}
