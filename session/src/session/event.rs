// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::error::Error;
use crate::session::SessionState;

/// High-level event published on the session's event bus.
///
/// Events are emitted in a strictly monotonic order matching the actual
/// transitions. The bus completes when the session is disposed and never
/// errors.
#[derive(Debug, Clone)]
pub enum Event {
    /// The session state changed.
    StateChanged(SessionState),
    /// An error was caught outside any caller's control flow, e.g. a
    /// stage failure while processing an inbound document.
    ExceptionCaught(Arc<Error>),
    /// The transport connection is gone.
    ConnectionTerminated,
    /// The transport finished its TLS upgrade during StartTLS.
    StartTlsHandshakeCompleted,
}
