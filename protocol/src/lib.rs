//! # Tick Protocol
//!
//! Wire-level definitions shared by participants and by the harness that
//! drives them. Nothing in this crate performs I/O; it only describes what
//! goes over the wire and how to turn bytes into typed messages and back.
//!
//! ## Message Families
//!
//! ### Participant to server (`OutboundMessage`)
//! - `{Agent, Handshake}`: sent once, before anything else
//! - `{Agent, Method, Arguments, RequestId}`: ad-hoc request
//! - `{Agent, Method: "mutations", Arguments: [tick, [commands]]}`: per-tick batch
//!
//! ### Server to participant (`InboundMessage`)
//! - `{RequestId, Results}`: response to a request
//! - `{Method: "tick", Arguments: [tick, snapshot]}`: tick push
//!
//! ### Datagram participants (`Datagram`)
//! - `{AgentId, Type: "Handshake" | "Mutation", Payload}`
//!
//! ## Framing
//!
//! Byte streams carry one JSON record per `\n`-terminated line and are
//! reassembled with `LineBuffer`; datagram transports carry one record per
//! datagram. A frame that does not parse is `MalformedMessage`; a record
//! that parses but fits no shape is `InvalidMessage`.

pub mod codec;
pub mod datagram;
pub mod error;
pub mod message;

pub use codec::{decode, encode, encode_line, LineBuffer, WireMessage, MAX_FRAME_LEN};
pub use datagram::{Datagram, DatagramKind};
pub use error::ProtocolError;
pub use message::{
    Command, InboundMessage, OutboundMessage, TickNotification, MUTATIONS_METHOD, TICK_METHOD,
};
