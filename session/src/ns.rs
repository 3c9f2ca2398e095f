// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespaces used by the session core.

/// RFC 6120: stream header and `<stream:features/>`/`<stream:error/>`.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: stream error defined conditions.
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 7395: WebSocket framing `<open/>`/`<close/>` documents.
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";

/// RFC 6120: client-to-server stanzas.
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: server-to-server stanzas.
pub const JABBER_SERVER: &str = "jabber:server";

/// RFC 6120: StartTLS negotiation.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120: SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120: resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// RFC 6120: stanza error defined conditions.
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// XEP-0138 era stream compression feature.
pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";

/// XEP-0030: service discovery, info queries.
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// XEP-0030: service discovery, item queries.
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// XEP-0092: software version queries.
pub const VERSION: &str = "jabber:iq:version";

/// XEP-0156: host-meta link relation for WebSocket endpoints.
pub const ALT_WEBSOCKET: &str = "urn:xmpp:alt-connections:websocket";

/// XEP-0156: host-meta link relation for BOSH endpoints.
pub const ALT_XBOSH: &str = "urn:xmpp:alt-connections:xbosh";
