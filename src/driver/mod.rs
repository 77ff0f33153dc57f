//! PostgreSQL Driver Module
//!
//! - `session.rs` - sans-I/O engine: frames in, events and bytes out
//! - `connection.rs` - tokio transport driving a `Session`
//! - `context.rs` - server-assigned per-connection state
//! - `result.rs` - RowDescription / DataRow / CommandComplete decoding

mod connection;
mod context;
mod result;
mod session;

use std::collections::VecDeque;

pub use connection::PgConnection;
pub use context::ConnectionContext;
pub use result::{Column, ResultDecoder, ResultSet, Row, parse_affected_rows};
pub use session::Session;

use crate::error::PgError;
use crate::protocol::{ErrorFields, TransactionStatus};

/// Application-visible outcome of processing backend frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Authentication succeeded.
    Connected,
    ParameterStatus { name: String, value: String },
    BackendKey { process_id: i32 },
    /// The server is idle; the next command may be submitted.
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<Column>),
    Row(Row),
    CommandComplete {
        tag: String,
        result: Option<ResultSet>,
    },
    EmptyQuery,
    ServerError(ErrorFields),
    Notice(ErrorFields),
    /// A frame that could not be decoded was discarded.
    DecodeError { tag: char, message: String },
}

/// Supplies command text; the input side of the client.
pub trait CommandSource {
    /// Next command to run, or `None` to end the session.
    fn next_command(&mut self) -> Option<String>;
}

/// Receives decoded events; the output side of the client.
pub trait EventSink {
    fn on_event(&mut self, event: &Event);

    /// A non-fatal client-side error (e.g. a rejected command).
    fn on_error(&mut self, error: &PgError) {
        let _ = error;
    }
}

impl CommandSource for VecDeque<String> {
    fn next_command(&mut self) -> Option<String> {
        self.pop_front()
    }
}

/// Collects every event, mostly for tests.
impl EventSink for Vec<Event> {
    fn on_event(&mut self, event: &Event) {
        self.push(event.clone());
    }
}
