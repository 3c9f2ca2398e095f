// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client-side [XMPP](https://xmpp.org/) session core with asynchronous
//! I/O using [tokio](https://tokio.rs/).
//!
//! This crate is the protocol engine between a byte transport and
//! higher-level plugins: it drives a freshly opened connection through
//! TLS, SASL authentication and resource binding, then exchanges stanzas
//! and correlates iq requests with their responses.
//!
//! # Getting started
//!
//! Construct a [`Session`] with an account [`Jid`][`jid::Jid`] and a
//! [`Transport`] implementation, call [`Session::login`], then use
//! [`Session::send`], [`Session::send_iq_query`] and the
//! [`Session::stanzas`] stream. Optional functionality hooks in through
//! [`Plugin`]s registered with [`Session::apply`].
//!
//! # What this crate is not
//!
//! Not a server, not a federated router and not a transport: concrete
//! WebSocket/TCP/BOSH byte layers implement the [`Transport`] contract
//! and live outside this crate, as do DNS and host-meta discovery (see
//! [`transport::ConnectionHint`]).

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub use jid;
pub use minidom;

pub mod error;
pub mod handshake;
pub mod ns;
pub mod pipeline;
pub mod session;
pub mod stanza;
pub mod stream;
pub mod transport;

#[doc(inline)]
pub use crate::error::Error;
pub use crate::handshake::{CredentialRetriever, HandshakeState, Handshaker, StaticPassword};
pub use crate::pipeline::{PassThrough, Pipeline, PipelineState, Stage, StageContext};
pub use crate::session::{
    Event, IqSignature, LoginOptions, Plugin, PluginInit, Session, SessionHandle, SessionState,
};
pub use crate::stanza::{IqType, Stanza, StanzaKind};
pub use crate::stream::StreamFeature;
pub use crate::transport::Transport;

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::jid;
        #[allow(unused_imports)]
        use crate::minidom;
    }
}
