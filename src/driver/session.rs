//! Sans-I/O protocol engine for one connection.
//!
//! Bytes read from the transport go in through [`Session::feed`]; decoded
//! [`Event`]s come out of [`Session::poll_event`] and bytes to write come out
//! of [`Session::take_outgoing`]. Each feed drains every complete frame
//! before returning.

use std::collections::VecDeque;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use super::context::ConnectionContext;
use super::result::ResultDecoder;
use super::Event;
use crate::config::ConnectConfig;
use crate::error::{PgError, PgResult};
use crate::protocol::{
    AuthPhase, AuthStep, Authenticator, BackendMessage, Frame, FrameBuffer, FrontendMessage,
};

enum State {
    /// Startup sent; 'R' frames go to the authenticator.
    Authenticating(Authenticator),
    /// Result frames go to the result decoder.
    Authenticated,
    /// Handshake or framing failure; nothing else is processed.
    Failed,
    Closed,
}

/// Protocol state of a single connection.
pub struct Session {
    state: State,
    frames: FrameBuffer,
    context: ConnectionContext,
    results: ResultDecoder,
    events: VecDeque<Event>,
    outgoing: Vec<u8>,
}

impl Session {
    /// Create a session and queue the startup message.
    pub fn new(config: &ConnectConfig) -> Self {
        let authenticator = Authenticator::new(&config.user, config.password.as_deref());
        Self::with_authenticator(config, authenticator)
    }

    /// Create a session around a prepared authenticator.
    pub fn with_authenticator(config: &ConnectConfig, authenticator: Authenticator) -> Self {
        let mut startup = FrontendMessage::startup(&config.user, &config.database);
        if let (FrontendMessage::Startup { params }, Some(name)) =
            (&mut startup, &config.application_name)
        {
            params.push(("application_name".to_string(), name.clone()));
        }

        let mut session = Self {
            state: State::Authenticating(authenticator),
            frames: FrameBuffer::with_max_frame_len(config.max_frame_len),
            context: ConnectionContext::new(),
            results: ResultDecoder::new(),
            events: VecDeque::new(),
            outgoing: Vec::new(),
        };
        session.queue(startup);
        session
    }

    /// Append bytes from the transport and process every complete frame.
    ///
    /// Events produced before a fatal error stay queued.
    pub fn feed(&mut self, data: &[u8]) -> PgResult<()> {
        self.ensure_open()?;
        self.frames.feed(data);
        self.process()
    }

    /// Buffer the transport reads into directly; follow with [`Session::process`].
    pub(crate) fn recv_buffer(&mut self) -> &mut BytesMut {
        self.frames.buf_mut()
    }

    /// Process every complete frame currently buffered.
    pub fn process(&mut self) -> PgResult<()> {
        self.ensure_open()?;
        loop {
            let frame = match self.frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "framing error");
                    self.release(State::Failed);
                    return Err(e);
                }
            };
            if let Err(e) = self.dispatch(frame) {
                self.release(State::Failed);
                return Err(e);
            }
        }
    }

    /// Next decoded event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Bytes waiting to be written.
    pub fn take_outgoing(&mut self) -> Option<Vec<u8>> {
        if self.outgoing.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.outgoing))
        }
    }

    /// Queue a simple query. Only valid while the server is ready.
    pub fn submit_query(&mut self, sql: &str) -> PgResult<()> {
        match self.state {
            State::Authenticated => {}
            State::Authenticating(_) => return Err(PgError::NotReady),
            State::Failed | State::Closed => return Err(PgError::Closed),
        }
        if !self.context.is_ready() {
            return Err(PgError::NotReady);
        }
        if sql.contains('\0') {
            return Err(PgError::InvalidCommand(
                "command text contains a NUL byte".to_string(),
            ));
        }
        debug!(sql, "submitting query");
        self.queue(FrontendMessage::Query(sql.to_string()));
        self.context.mark_busy();
        Ok(())
    }

    /// Close gracefully: queue Terminate when logged in, then release state.
    pub fn close(&mut self) {
        if matches!(self.state, State::Authenticated) {
            self.queue(FrontendMessage::Terminate);
        }
        self.release(State::Closed);
    }

    /// Release everything without sending anything (transport went away).
    pub fn abort(&mut self) {
        self.outgoing.clear();
        self.release(State::Closed);
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Authentication phase; `None` once the handshake state is gone.
    pub fn auth_phase(&self) -> Option<AuthPhase> {
        match &self.state {
            State::Authenticating(auth) => Some(auth.phase()),
            State::Authenticated => Some(AuthPhase::Authenticated),
            State::Failed => Some(AuthPhase::Failed),
            State::Closed => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Authenticated)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Failed | State::Closed)
    }

    /// Bytes of an incomplete frame still held.
    pub fn buffered_len(&self) -> usize {
        self.frames.len()
    }

    fn ensure_open(&self) -> PgResult<()> {
        match self.state {
            State::Failed | State::Closed => Err(PgError::Closed),
            _ => Ok(()),
        }
    }

    /// Drop the reassembly buffer and any authentication secrets.
    fn release(&mut self, state: State) {
        self.state = state;
        self.frames.clear();
        self.results.reset();
    }

    fn queue(&mut self, message: FrontendMessage) {
        self.outgoing.extend(message.encode());
    }

    fn dispatch(&mut self, frame: Frame) -> PgResult<()> {
        debug!(tag = %(frame.tag as char), len = frame.payload.len(), "frame");
        let authenticating = matches!(self.state, State::Authenticating(_));

        let message = match BackendMessage::decode(&frame) {
            Ok(message) => message,
            // Anything malformed during the handshake aborts it.
            Err(e) if authenticating => return Err(e),
            Err(e) => {
                warn!(error = %e, "discarding undecodable frame");
                self.events.push_back(Event::DecodeError {
                    tag: frame.tag as char,
                    message: e.to_string(),
                });
                return Ok(());
            }
        };

        if authenticating {
            self.on_handshake_message(message)
        } else {
            self.on_result_message(message);
            Ok(())
        }
    }

    fn on_handshake_message(&mut self, message: BackendMessage) -> PgResult<()> {
        let State::Authenticating(auth) = &mut self.state else {
            return Ok(());
        };
        match message {
            BackendMessage::Authentication(request) => match auth.on_request(request)? {
                AuthStep::Send(response) => self.queue(response),
                AuthStep::Wait => {}
                AuthStep::Authenticated => {
                    info!("connected");
                    // Drops the authenticator and its secrets.
                    self.state = State::Authenticated;
                    self.events.push_back(Event::Connected);
                }
            },
            BackendMessage::ErrorResponse(fields) => {
                auth.fail();
                self.events.push_back(Event::ServerError(fields.clone()));
                return Err(PgError::Server(fields));
            }
            BackendMessage::NoticeResponse(fields) => {
                self.events.push_back(Event::Notice(fields));
            }
            BackendMessage::Unknown(tag) => {
                debug!(tag = %(tag as char), "ignoring frame during handshake");
            }
            other => {
                auth.fail();
                return Err(PgError::Protocol(format!(
                    "{} before authentication completed",
                    message_name(&other)
                )));
            }
        }
        Ok(())
    }

    fn on_result_message(&mut self, message: BackendMessage) {
        let event = match message {
            BackendMessage::RowDescription(fields) => self.results.on_row_description(fields),
            BackendMessage::DataRow(values) => self.results.on_data_row(values),
            BackendMessage::CommandComplete(tag) => self.results.on_command_complete(tag),
            BackendMessage::EmptyQueryResponse => {
                self.results.reset();
                Event::EmptyQuery
            }
            BackendMessage::ErrorResponse(fields) => {
                self.results.reset();
                Event::ServerError(fields)
            }
            BackendMessage::NoticeResponse(fields) => Event::Notice(fields),
            BackendMessage::ParameterStatus { name, value } => {
                self.context.set_parameter(name.clone(), value.clone());
                Event::ParameterStatus { name, value }
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => match self.context.set_backend_key(process_id, secret_key) {
                Ok(()) => Event::BackendKey { process_id },
                Err(e) => Event::DecodeError {
                    tag: 'K',
                    message: e.to_string(),
                },
            },
            BackendMessage::ReadyForQuery(status) => {
                self.results.reset();
                self.context.mark_ready(status);
                Event::ReadyForQuery(status)
            }
            BackendMessage::Authentication(_) => Event::DecodeError {
                tag: 'R',
                message: "authentication request after login".to_string(),
            },
            BackendMessage::Unknown(tag) => {
                debug!(tag = %(tag as char), "ignoring frame");
                return;
            }
        };
        self.events.push_back(event);
    }
}

fn message_name(message: &BackendMessage) -> &'static str {
    match message {
        BackendMessage::Authentication(_) => "Authentication",
        BackendMessage::ErrorResponse(_) => "ErrorResponse",
        BackendMessage::NoticeResponse(_) => "NoticeResponse",
        BackendMessage::ParameterStatus { .. } => "ParameterStatus",
        BackendMessage::BackendKeyData { .. } => "BackendKeyData",
        BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
        BackendMessage::RowDescription(_) => "RowDescription",
        BackendMessage::DataRow(_) => "DataRow",
        BackendMessage::CommandComplete(_) => "CommandComplete",
        BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
        BackendMessage::Unknown(_) => "unknown message",
    }
}
