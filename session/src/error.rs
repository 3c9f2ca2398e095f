// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Detailed error types.

use core::fmt;
use std::error::Error as StdError;

use sasl::client::MechanismError as SaslMechanismError;

use crate::pipeline::PipelineError;
use crate::stanza::error::StanzaError;
use crate::stream::error::StreamError;

/// Top-level error type.
#[derive(Debug)]
pub enum Error {
    /// Error parsing a Jabber-Id.
    JidParse(jid::Error),
    /// Protocol-level error.
    Protocol(ProtocolError),
    /// Authentication error.
    Auth(AuthError),
    /// Caller invoked an operation that is illegal in the current state.
    State(StateError),
    /// Structural or lifecycle error raised by the pipeline.
    Pipeline(PipelineError),
    /// A stream error terminated the stream (sent or received).
    Stream(StreamError),
    /// A stanza-level error, carried by an iq response.
    Stanza(StanzaError),
    /// Error specific to the transport implementation.
    Connection(Box<dyn StdError + Send + Sync>),
    /// Connection closed.
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::State(e) => write!(fmt, "{}", e),
            Error::Pipeline(e) => write!(fmt, "pipeline error: {}", e),
            Error::Stream(e) => write!(fmt, "stream error: {}", e),
            Error::Stanza(e) => write!(fmt, "stanza error: {}", e),
            Error::Connection(e) => write!(fmt, "connection error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
        }
    }
}

impl StdError for Error {}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<StateError> for Error {
    fn from(e: StateError) -> Self {
        Error::State(e)
    }
}

impl From<PipelineError> for Error {
    fn from(e: PipelineError) -> Self {
        Error::Pipeline(e)
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Error::Stream(e)
    }
}

impl From<StanzaError> for Error {
    fn from(e: StanzaError) -> Self {
        Error::Stanza(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

/// XMPP protocol-level error.
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error.
    Parser(minidom::Error),
    /// A document that should be a stanza is not one.
    NotAStanza,
    /// Invalid stream header (`<open/>`).
    InvalidStreamHeader,
    /// Invalid response to resource binding.
    InvalidBindResponse,
    /// The server offered no way to finish the mandatory negotiation.
    MissingFeatures,
    /// The server refused the StartTLS upgrade.
    StartTlsRefused,
    /// Encountered an element that is not allowed at this point.
    UnexpectedElement {
        /// Local name of the offending element.
        name: String,
        /// Namespace of the offending element.
        ns: String,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::NotAStanza => write!(fmt, "document is not a stanza"),
            ProtocolError::InvalidStreamHeader => write!(fmt, "invalid stream header"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::MissingFeatures => {
                write!(fmt, "mandatory stream features left unnegotiable")
            }
            ProtocolError::StartTlsRefused => write!(fmt, "server refused STARTTLS"),
            ProtocolError::UnexpectedElement { name, ns } => {
                write!(fmt, "unexpected element {{{}}}{}", ns, name)
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

/// Authentication error.
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available.
    NoMechanism,
    /// Local SASL implementation error.
    Sasl(SaslMechanismError),
    /// Failure from the server.
    Fail {
        /// The name of the `<failure/>` child element, e.g. `not-authorized`.
        condition: String,
        /// Optional human-readable text supplied by the server.
        text: Option<String>,
    },
}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(e) => write!(fmt, "local SASL implementation error: {}", e),
            AuthError::Fail { condition, text } => match text {
                Some(text) => write!(fmt, "failure from the server: {} ({})", condition, text),
                None => write!(fmt, "failure from the server: {}", condition),
            },
        }
    }
}

impl StdError for AuthError {}

impl From<SaslMechanismError> for AuthError {
    fn from(e: SaslMechanismError) -> Self {
        AuthError::Sasl(e)
    }
}

/// Caller invoked an operation that is illegal in the current state.
///
/// Never retried internally; reported synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    /// The operation that was attempted.
    pub operation: &'static str,
    /// The name of the state the component was in.
    pub state: &'static str,
}

impl StateError {
    /// Build a state violation report.
    pub fn new(operation: &'static str, state: &'static str) -> Self {
        StateError { operation, state }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "operation {:?} is not allowed in state {}",
            self.operation, self.state
        )
    }
}

impl StdError for StateError {}
