//! # pgwire-lite
//!
//! A minimal PostgreSQL client speaking protocol v3 directly: frame
//! reassembly, SCRAM-SHA-256 login, and the simple query protocol.
//!
//! ## Layers
//!
//! | Module               | Role                                          |
//! |----------------------|-----------------------------------------------|
//! | `protocol::framing`  | byte stream → `(tag, payload)` frames         |
//! | `protocol::wire`     | frame ↔ typed message                         |
//! | `protocol::auth`     | SCRAM-SHA-256 and the login state machine     |
//! | `driver::Session`    | sans-I/O engine: bytes in, events + bytes out |
//! | `driver::PgConnection` | tokio transport around a `Session`          |
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use std::collections::VecDeque;
//! use pgwire_lite::{ConnectConfig, Event, PgConnection};
//!
//! # async fn demo() -> pgwire_lite::PgResult<()> {
//! let config = ConnectConfig {
//!     password: Some("secret".into()),
//!     ..ConnectConfig::default()
//! };
//! let mut conn = PgConnection::connect(&config).await?;
//! let mut commands = VecDeque::from(vec!["SELECT 1".to_string()]);
//! let mut events: Vec<Event> = Vec::new();
//! conn.run(&mut commands, &mut events).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;

pub use config::ConnectConfig;
pub use driver::{
    Column, CommandSource, ConnectionContext, Event, EventSink, PgConnection, ResultSet, Row,
    Session,
};
pub use error::{PgError, PgResult};
