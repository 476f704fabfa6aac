//! Participant records for the datagram transport
//!
//! On the datagram variant participants do not use the stream handshake
//! and batch records. Instead every datagram they send is wrapped as
//! `{AgentId, Type, Payload}`; the server side keeps sending ordinary
//! `InboundMessage` tick pushes, one per datagram.

use crate::codec::WireMessage;
use crate::error::{ProtocolError, Result};
use crate::message::{shape, Command};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatagramKind {
    Handshake,
    Mutation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datagram {
    #[serde(rename = "AgentId")]
    pub agent_id: String,
    #[serde(rename = "Type")]
    pub kind: DatagramKind,
    #[serde(rename = "Payload", default)]
    pub payload: Value,
}

impl Datagram {
    pub fn handshake(agent_id: impl Into<String>, greetings: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind: DatagramKind::Handshake,
            payload: json!({ "Greetings": greetings.into() }),
        }
    }

    /// Reply to the tick `turn` carrying that tick's commands
    pub fn mutation(agent_id: impl Into<String>, turn: u64, mutations: &[Command]) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind: DatagramKind::Mutation,
            payload: json!({ "Turn": turn, "Mutations": mutations }),
        }
    }

    /// The tick a mutation reply answers (`Payload.Turn`)
    pub fn turn(&self) -> Option<u64> {
        self.payload.get("Turn").and_then(Value::as_u64)
    }

    pub fn greetings(&self) -> Option<&str> {
        self.payload.get("Greetings").and_then(Value::as_str)
    }

    pub fn mutations(&self) -> Result<Vec<Command>> {
        match self.payload.get("Mutations") {
            Some(Value::Array(items)) => items
                .iter()
                .filter(|item| !item.is_null())
                .map(|item| shape(item.clone(), "command"))
                .collect(),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(ProtocolError::InvalidMessage(format!(
                "mutation list must be an array, got {}",
                other
            ))),
        }
    }
}

impl WireMessage for Datagram {
    fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn from_value(value: Value) -> Result<Self> {
        shape(value, "datagram")
    }
}
