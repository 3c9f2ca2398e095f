// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The transport collaborator contract.
//!
//! The session core requires only a bidirectional framed XML document
//! stream. Concrete byte transports (WebSocket per RFC 7395, plain TCP
//! framed per RFC 6120, BOSH) live outside this crate and integrate like
//! this:
//!
//! - `open` establishes the byte layer; once open, the transport feeds
//!   every inbound document into
//!   [`Session::feed`][`crate::session::Session::feed`] and drains
//!   [`Session::outbound_documents`][`crate::session::Session::outbound_documents`]
//!   onto the wire, serializing each document.
//! - On abnormal closure the transport calls
//!   [`Session::connection_terminated`][`crate::session::Session::connection_terminated`].
//! - `start_tls` is called at most once, when StartTLS negotiates.

use futures::future::BoxFuture;

use crate::error::Error;

/// A byte transport as seen by the session core.
pub trait Transport: Send + Sync + 'static {
    /// Establish the byte layer.
    fn open(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Tear the byte layer down. Must be idempotent.
    fn close(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Upgrade the connection to TLS in place.
    fn start_tls(&self) -> BoxFuture<'_, Result<(), Error>>;
}

/// Protocols a discovery helper may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// Long-lived XML stream over TCP, RFC 6120 framing.
    Tcp,
    /// WebSocket subprotocol, RFC 7395 framing.
    WebSocket,
}

/// How TLS is established on a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// TLS from the first byte.
    Direct,
    /// Cleartext until `<starttls/>` negotiates the upgrade.
    StartTls,
}

/// Where and how to connect, as produced by host-meta or DNS discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHint {
    /// The transport protocol to use.
    pub protocol: TransportProtocol,
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// URL path, for WebSocket endpoints.
    pub path: Option<String>,
    /// TLS establishment mode, for TCP endpoints.
    pub tls: Option<TlsMode>,
}

/// Well-known path of the XML host-meta document.
pub const WELL_KNOWN_HOST_META: &str = "/.well-known/host-meta";

/// Well-known path of the JSON host-meta document.
pub const WELL_KNOWN_HOST_META_JSON: &str = "/.well-known/host-meta.json";

/// DNS SRV service for client connections with StartTLS.
pub const SRV_CLIENT: &str = "_xmpp-client._tcp";

/// DNS SRV service for direct-TLS client connections.
pub const SRV_CLIENT_TLS: &str = "_xmpps-client._tcp";

/// DNS TXT owner for alternative connection methods.
pub const TXT_RECORD: &str = "_xmppconnect";

/// Prefix of TXT values announcing a WebSocket endpoint.
pub const TXT_WEBSOCKET_KEY: &str = "_xmpp-client-websocket";
