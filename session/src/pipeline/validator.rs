// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use minidom::Element;

use crate::error::Error;
use crate::ns;
use crate::pipeline::{Stage, StageContext};
use crate::stanza::Stanza;
use crate::stream::error::{DefinedCondition, StreamError};

/// Inbound schema gate, installed between the head of the inbound chain
/// and the handshaker.
///
/// Any inbound document whose root looks like a stanza must carry one of
/// the stanza namespaces; violations raise a validation error carrying a
/// stream error with condition `invalid-xml` on the inbound error stream.
/// Non-stanza documents pass unchanged.
pub struct XmlValidator;

impl Stage for XmlValidator {
    fn on_read(&self, _ctx: &StageContext, item: Element) -> Result<Vec<Element>, Error> {
        if Stanza::is_stanza_root(&item) {
            let ns = item.ns();
            if ns != ns::JABBER_CLIENT && ns != ns::JABBER_SERVER {
                log::warn!(
                    "inbound <{}/> carries non-stanza namespace {:?}",
                    item.name(),
                    ns
                );
                return Err(StreamError::new(DefinedCondition::InvalidXml)
                    .with_text("stanza in unsupported namespace")
                    .into());
            }
        }
        Ok(vec![item])
    }
}
