// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Resource binding wire helpers.

use minidom::Element;

use jid::Jid;

use crate::error::ProtocolError;
use crate::ns;
use crate::stanza::{IqType, Stanza};

/// Build the `<iq type='set'>` that requests a binding.
///
/// An empty `resource` asks the server to pick one.
pub(crate) fn bind_request(id: &str, resource: &str) -> Element {
    let mut bind = Element::builder("bind", ns::BIND);
    if !resource.is_empty() {
        bind = bind.append(
            Element::builder("resource", ns::BIND)
                .append(resource.to_owned())
                .build(),
        );
    }
    Stanza::iq_template(IqType::Set, id, None)
        .with_payload(bind.build())
        .into_element()
}

/// Extract the bound JID from a bind result iq.
pub(crate) fn jid_from_response(iq: &Element) -> Result<Jid, ProtocolError> {
    let bind = iq
        .get_child("bind", ns::BIND)
        .ok_or(ProtocolError::InvalidBindResponse)?;
    let jid = bind
        .get_child("jid", ns::BIND)
        .ok_or(ProtocolError::InvalidBindResponse)?;
    Jid::new(jid.text().trim()).map_err(|_| ProtocolError::InvalidBindResponse)
}
