// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed views over stanza documents.
//!
//! The session core keeps stanzas as plain [`minidom::Element`] documents
//! and isolates every piece of DOM access behind the helpers in this
//! module, so the state machines above it only deal in typed values.

use minidom::Element;
use rand::{thread_rng, Rng};

use jid::Jid;

use crate::error::ProtocolError;
use crate::ns;

pub mod error;

use self::error::StanzaError;

/// Generate a process-unique stanza id.
pub fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// Assign a fresh id to a stanza element if it has none.
///
/// Non-stanza documents are left untouched.
pub fn ensure_id(element: &mut Element) {
    if Stanza::is_stanza_root(element) && element.attr("id").map_or(true, str::is_empty) {
        element.set_attr("id", make_id());
    }
}

/// The three stanza kinds of RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// An `<iq/>` request or response.
    Iq,
    /// A `<message/>`.
    Message,
    /// A `<presence/>`.
    Presence,
}

/// The `type` attribute of an `<iq/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    /// Request for information.
    Get,
    /// Request changing some state.
    Set,
    /// Successful response.
    Result,
    /// Error response.
    Error,
}

impl IqType {
    fn from_attr(s: &str) -> Option<IqType> {
        match s {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }

    /// The wire form of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

/// An immutable wrapper around a stanza document.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    element: Element,
}

impl Stanza {
    /// Whether the element's local name is one of the stanza names.
    ///
    /// This does not check the namespace; the XML validator stage owns
    /// that rule.
    pub fn is_stanza_root(element: &Element) -> bool {
        matches!(element.name(), "iq" | "message" | "presence")
    }

    /// Wrap a document, verifying that its root is a stanza under one of
    /// the stanza namespaces.
    pub fn from_element(element: Element) -> Result<Stanza, ProtocolError> {
        if !Stanza::is_stanza_root(&element) {
            return Err(ProtocolError::NotAStanza);
        }
        let ns = element.ns();
        if ns != ns::JABBER_CLIENT && ns != ns::JABBER_SERVER {
            return Err(ProtocolError::NotAStanza);
        }
        Ok(Stanza { element })
    }

    /// Build an iq template: `<iq type=… id=… [to=…]/>`.
    pub fn iq_template(iq_type: IqType, id: &str, to: Option<&Jid>) -> Stanza {
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", iq_type.as_str())
            .attr("id", id);
        if let Some(to) = to {
            builder = builder.attr("to", to.to_string());
        }
        Stanza {
            element: builder.build(),
        }
    }

    /// Build an empty iq result for answering a request.
    pub fn iq_result(id: &str, to: Option<&Jid>) -> Stanza {
        Stanza::iq_template(IqType::Result, id, to)
    }

    /// Build an iq error response to a request, optionally echoing the
    /// original payload before the `<error/>` element.
    pub fn iq_error(
        id: &str,
        to: Option<&Jid>,
        error: &StanzaError,
        original_payload: Option<Element>,
    ) -> Stanza {
        let mut element = Stanza::iq_template(IqType::Error, id, to).into_element();
        if let Some(payload) = original_payload {
            element.append_child(payload);
        }
        element.append_child(error.to_element());
        Stanza { element }
    }

    /// Append a payload element, consuming and returning the stanza.
    pub fn with_payload(mut self, payload: Element) -> Stanza {
        self.element.append_child(payload);
        self
    }

    /// The stanza kind.
    pub fn kind(&self) -> StanzaKind {
        match self.element.name() {
            "iq" => StanzaKind::Iq,
            "message" => StanzaKind::Message,
            _ => StanzaKind::Presence,
        }
    }

    /// The stanza id, if present.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// The sender address, if present and well-formed.
    pub fn from_addr(&self) -> Option<Jid> {
        self.element.attr("from").and_then(|s| Jid::new(s).ok())
    }

    /// The recipient address, if present and well-formed.
    pub fn to_addr(&self) -> Option<Jid> {
        self.element.attr("to").and_then(|s| Jid::new(s).ok())
    }

    /// For an iq, the parsed `type` attribute.
    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind() != StanzaKind::Iq {
            return None;
        }
        self.element.attr("type").and_then(IqType::from_attr)
    }

    /// Local name and namespace of the first child element.
    ///
    /// Plugins dispatch inbound iqs on this pair.
    pub fn payload_signature(&self) -> Option<(String, String)> {
        self.payload()
            .map(|child| (child.name().to_owned(), child.ns()))
    }

    /// The first child element, if any.
    pub fn payload(&self) -> Option<&Element> {
        self.element.children().next()
    }

    /// Decode the `<error/>` child of an error stanza.
    pub fn error(&self) -> Option<StanzaError> {
        let ns = self.element.ns();
        let error = self.element.get_child("error", ns.as_str())?;
        StanzaError::from_element(error).ok()
    }

    /// Borrow the underlying document.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Unwrap into the underlying document.
    pub fn into_element(self) -> Element {
        self.element
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        stanza.element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iq_template_renders_attributes() {
        let to = Jid::new("example.org").unwrap();
        let iq = Stanza::iq_template(IqType::Get, "Q1", Some(&to));
        let element = iq.element();
        assert!(element.is("iq", ns::JABBER_CLIENT));
        assert_eq!(element.attr("type"), Some("get"));
        assert_eq!(element.attr("id"), Some("Q1"));
        assert_eq!(element.attr("to"), Some("example.org"));
    }

    #[test]
    fn iq_template_without_to() {
        let iq = Stanza::iq_template(IqType::Set, "B1", None);
        assert_eq!(iq.element().attr("to"), None);
        assert_eq!(iq.iq_type(), Some(IqType::Set));
    }

    #[test]
    fn kind_and_payload() {
        let elem: Element = "<iq xmlns='jabber:client' type='get' id='Q1'>
                <query xmlns='http://jabber.org/protocol/disco#info'/>
            </iq>"
            .parse()
            .unwrap();
        let stanza = Stanza::from_element(elem).unwrap();
        assert_eq!(stanza.kind(), StanzaKind::Iq);
        assert_eq!(stanza.iq_type(), Some(IqType::Get));
        let (name, ns) = stanza.payload_signature().unwrap();
        assert_eq!(name, "query");
        assert_eq!(ns, ns::DISCO_INFO);
    }

    #[test]
    fn rejects_non_stanza_roots() {
        let elem: Element = "<features xmlns='http://etherx.jabber.org/streams'/>"
            .parse()
            .unwrap();
        assert!(Stanza::from_element(elem).is_err());
    }

    #[test]
    fn rejects_wrong_namespace() {
        let elem: Element = "<iq xmlns='urn:example:nope' type='get' id='x'/>"
            .parse()
            .unwrap();
        assert!(Stanza::from_element(elem).is_err());
    }

    #[test]
    fn addresses_are_parsed() {
        let elem: Element =
            "<message xmlns='jabber:client' from='alice@example.org/tablet' to='bob@example.org'/>"
                .parse()
                .unwrap();
        let stanza = Stanza::from_element(elem).unwrap();
        assert_eq!(
            stanza.from_addr().unwrap().to_string(),
            "alice@example.org/tablet"
        );
        assert_eq!(stanza.to_addr().unwrap().to_string(), "bob@example.org");
    }

    #[test]
    fn ensure_id_fills_missing_ids_only() {
        let mut elem: Element = "<message xmlns='jabber:client'/>".parse().unwrap();
        ensure_id(&mut elem);
        assert!(!elem.attr("id").unwrap().is_empty());

        let mut elem: Element = "<message xmlns='jabber:client' id='keep'/>".parse().unwrap();
        ensure_id(&mut elem);
        assert_eq!(elem.attr("id"), Some("keep"));
    }

    #[test]
    fn make_id_is_unique_enough() {
        let a = make_id();
        let b = make_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
