//! # Participant Session Library
//!
//! Client side of the tick protocol: everything a participant needs to
//! connect to a simulation server, answer its ticks and issue ad-hoc
//! requests, over one duplex byte stream.
//!
//! ## Architecture Overview
//!
//! A session is built from three cooperating parts that share one
//! connection:
//!
//! ### Request Multiplexing (`multiplexer`)
//! Ad-hoc requests carry a session-unique correlation id. Any number of
//! requests may be in flight at once and their responses may come back in
//! any order; each caller is resumed with the result of its own request.
//! - Ids are allocated monotonically from 0
//! - A response for an unknown id is a protocol violation
//! - Closing the session fails every pending request
//!
//! ### Tick Dispatch (`dispatcher`)
//! The server pushes one notification per tick. Notifications are handed to
//! the registered handler strictly in arrival order, one at a time. The
//! handler never blocks the read loop, so responses keep flowing while it
//! works on a tick. Handlers are either plain closures (`on_tick`) or
//! return a future (`on_tick_async`) and may await requests mid-tick.
//!
//! ### Command Batching (`batcher`)
//! Whatever the handler returns for a tick is sent back as that tick's
//! mutation batch, with `None` placeholders removed. Batches are never
//! acknowledged.
//! - Exactly one batch per tick: a handler that submitted through its
//!   `SessionHandle` returns nothing and no second batch is sent
//! - Batches go out in increasing tick order
//!
//! ### Session Lifecycle (`session`)
//! Connect, handshake, run, close. The handshake is always the first record
//! on the wire. Malformed frames, unknown methods and out-of-sync responses
//! end the session; there is no reconnection.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::{Session, SessionError, TickResult};
//! use protocol::Command;
//! use serde_json::{json, Value};
//!
//! # async fn example() -> Result<(), SessionError> {
//! let mut session = Session::connect("127.0.0.1:8080", "agent-1").await?;
//!
//! let pong = session.request("ping", vec![json!(1)]).await?;
//! println!("ping answered with {}", pong);
//!
//! session.on_tick(|_tick: u64, _world: &Value| -> TickResult {
//!     Ok(vec![Some(Command::new("steer", json!([0, 1])))])
//! })?;
//!
//! session.run().await
//! # }
//! ```

pub mod batcher;
pub mod dispatcher;
pub mod error;
pub mod multiplexer;
pub mod session;

pub use batcher::{CommandBatch, MutationBatcher};
pub use dispatcher::{AsyncTickHandler, TickFuture, TickHandler, TickResult};
pub use error::{HandlerError, SessionError};
pub use multiplexer::{PendingRequests, PendingResponse, RequestMultiplexer};
pub use session::{Session, SessionHandle};
