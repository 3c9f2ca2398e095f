// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream-level vocabulary: open/close documents, headers and the
//! negotiable feature set.
//!
//! The pipeline deals in complete XML documents, so the stream header is
//! the RFC 7395 framing form (`<open/>`/`<close/>`); translating it to
//! `<stream:stream>` framing for raw TCP is the transport's business.

use minidom::Element;

use jid::Jid;

use crate::error::ProtocolError;
use crate::ns;

pub mod error;

/// Build the `<open/>` document that starts (or restarts) a stream.
pub fn open_element(to: &str) -> Element {
    Element::builder("open", ns::FRAMING)
        .attr("to", to)
        .attr("version", "1.0")
        .build()
}

/// Build the `<close/>` document that ends a stream.
pub fn close_element() -> Element {
    Element::builder("close", ns::FRAMING).build()
}

/// Whether a document is the peer's stream open.
pub fn is_open(element: &Element) -> bool {
    element.is("open", ns::FRAMING)
}

/// Whether a document is the peer's stream close.
pub fn is_close(element: &Element) -> bool {
    element.is("close", ns::FRAMING)
}

/// The attributes of a received stream header.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHeader {
    /// The sending entity, usually the server domain.
    pub from: Option<Jid>,
    /// The addressed entity.
    pub to: Option<Jid>,
    /// Server-assigned stream id.
    pub id: Option<String>,
    /// Advertised protocol version.
    pub version: Option<String>,
}

impl StreamHeader {
    /// Decode a framing `<open/>` document.
    pub fn from_element(element: &Element) -> Result<StreamHeader, ProtocolError> {
        if !is_open(element) {
            return Err(ProtocolError::InvalidStreamHeader);
        }
        Ok(StreamHeader {
            from: element.attr("from").and_then(|s| Jid::new(s).ok()),
            to: element.attr("to").and_then(|s| Jid::new(s).ok()),
            id: element.attr("id").map(str::to_owned),
            version: element.attr("version").map(str::to_owned),
        })
    }
}

/// The closed set of stream features this core negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFeature {
    /// TLS upgrade of the underlying connection.
    StartTls,
    /// SASL authentication.
    Sasl,
    /// XEP-0138 style stream compression. Understood but never selected;
    /// no compressor is wired in.
    StreamCompression,
    /// Resource binding.
    ResourceBinding,
}

impl StreamFeature {
    /// The recommended negotiation order.
    pub const RECOMMENDED_ORDER: [StreamFeature; 4] = [
        StreamFeature::StartTls,
        StreamFeature::Sasl,
        StreamFeature::StreamCompression,
        StreamFeature::ResourceBinding,
    ];

    /// The advertised element's local name.
    pub fn name(self) -> &'static str {
        match self {
            StreamFeature::StartTls => "starttls",
            StreamFeature::Sasl => "mechanisms",
            StreamFeature::StreamCompression => "compression",
            StreamFeature::ResourceBinding => "bind",
        }
    }

    /// The advertised element's namespace.
    pub fn namespace(self) -> &'static str {
        match self {
            StreamFeature::StartTls => ns::TLS,
            StreamFeature::Sasl => ns::SASL,
            StreamFeature::StreamCompression => ns::COMPRESS_FEATURE,
            StreamFeature::ResourceBinding => ns::BIND,
        }
    }

    /// Whether a client session cannot complete without this feature.
    pub fn mandatory(self) -> bool {
        !matches!(self, StreamFeature::StreamCompression)
    }

    /// Whether successful negotiation requires a stream restart.
    pub fn restart_required(self) -> bool {
        !matches!(self, StreamFeature::ResourceBinding)
    }
}

/// A parsed `<stream:features/>` document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    /// StartTLS offered, and whether the server marked it required.
    pub starttls: Option<StartTls>,
    /// SASL mechanism names offered.
    pub mechanisms: Vec<String>,
    /// Whether resource binding is offered.
    pub bind: bool,
    /// Stream compression methods offered.
    pub compression_methods: Vec<String>,
    /// Features this core does not understand.
    pub others: Vec<Element>,
}

/// The StartTLS feature advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct StartTls {
    /// Whether the server marked StartTLS as required.
    pub required: bool,
}

impl Features {
    /// Whether a document is a `<stream:features/>`.
    pub fn is_features(element: &Element) -> bool {
        element.is("features", ns::STREAM)
    }

    /// Decode a features document.
    pub fn from_element(element: &Element) -> Result<Features, ProtocolError> {
        if !Features::is_features(element) {
            return Err(ProtocolError::UnexpectedElement {
                name: element.name().to_owned(),
                ns: element.ns(),
            });
        }
        let mut features = Features::default();
        for child in element.children() {
            if child.is("starttls", ns::TLS) {
                features.starttls = Some(StartTls {
                    required: child.get_child("required", ns::TLS).is_some(),
                });
            } else if child.is("mechanisms", ns::SASL) {
                features.mechanisms = child
                    .children()
                    .filter(|mech| mech.is("mechanism", ns::SASL))
                    .map(|mech| mech.text())
                    .collect();
            } else if child.is("bind", ns::BIND) {
                features.bind = true;
            } else if child.is("compression", ns::COMPRESS_FEATURE) {
                features.compression_methods = child
                    .children()
                    .filter(|method| method.is("method", ns::COMPRESS_FEATURE))
                    .map(|method| method.text())
                    .collect();
            } else {
                features.others.push(child.clone());
            }
        }
        Ok(features)
    }

    /// Whether the server offered the given feature.
    pub fn offers(&self, feature: StreamFeature) -> bool {
        match feature {
            StreamFeature::StartTls => self.starttls.is_some(),
            StreamFeature::Sasl => !self.mechanisms.is_empty(),
            StreamFeature::StreamCompression => !self.compression_methods.is_empty(),
            StreamFeature::ResourceBinding => self.bind,
        }
    }

    /// The first unknown feature the server marks as required, if any.
    ///
    /// A `<required/>` child in the feature's own namespace is the
    /// conventional marker.
    pub fn required_unknown(&self) -> Option<&Element> {
        self.others.iter().find(|feature| {
            let ns = feature.ns();
            feature.get_child("required", ns.as_str()).is_some()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_document_shape() {
        let open = open_element("example.org");
        assert!(is_open(&open));
        assert_eq!(open.attr("to"), Some("example.org"));
        assert_eq!(open.attr("version"), Some("1.0"));
        assert!(is_close(&close_element()));
    }

    #[test]
    fn header_from_open() {
        let elem: Element = "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'
                 from='example.org' version='1.0' id='c2s1'/>"
            .parse()
            .unwrap();
        let header = StreamHeader::from_element(&elem).unwrap();
        assert_eq!(header.from.unwrap().domain(), "example.org");
        assert_eq!(header.id.as_deref(), Some("c2s1"));
        assert_eq!(header.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn feature_attributes() {
        assert!(StreamFeature::StartTls.mandatory());
        assert!(StreamFeature::Sasl.mandatory());
        assert!(StreamFeature::ResourceBinding.mandatory());
        assert!(!StreamFeature::StreamCompression.mandatory());

        assert!(StreamFeature::StartTls.restart_required());
        assert!(StreamFeature::Sasl.restart_required());
        assert!(StreamFeature::StreamCompression.restart_required());
        assert!(!StreamFeature::ResourceBinding.restart_required());
    }

    #[test]
    fn parse_sasl_mechanisms() {
        let elem: Element = "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>
                <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>
                    <mechanism>PLAIN</mechanism>
                    <mechanism>SCRAM-SHA-1</mechanism>
                </mechanisms>
            </stream:features>"
            .parse()
            .unwrap();
        let features = Features::from_element(&elem).unwrap();
        assert_eq!(features.mechanisms, ["PLAIN", "SCRAM-SHA-1"]);
        assert!(features.offers(StreamFeature::Sasl));
        assert!(!features.offers(StreamFeature::StartTls));
    }

    #[test]
    fn parse_required_starttls() {
        let elem: Element = "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>
                <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>
            </stream:features>"
            .parse()
            .unwrap();
        let features = Features::from_element(&elem).unwrap();
        assert!(features.offers(StreamFeature::StartTls));
        assert!(features.starttls.unwrap().required);
    }

    #[test]
    fn parse_bind_and_unknown() {
        let elem: Element = "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>
                <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>
                <sm xmlns='urn:xmpp:sm:3'/>
            </stream:features>"
            .parse()
            .unwrap();
        let features = Features::from_element(&elem).unwrap();
        assert!(features.offers(StreamFeature::ResourceBinding));
        assert_eq!(features.others.len(), 1);
        assert!(features.required_unknown().is_none());
    }

    #[test]
    fn unknown_required_feature_is_reported() {
        let elem: Element = "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>
                <exotic xmlns='urn:example:exotic'><required xmlns='urn:example:exotic'/></exotic>
            </stream:features>"
            .parse()
            .unwrap();
        let features = Features::from_element(&elem).unwrap();
        assert_eq!(features.required_unknown().unwrap().name(), "exotic");
    }

    #[test]
    fn empty_features() {
        let elem: Element = "<stream:features xmlns:stream='http://etherx.jabber.org/streams'/>"
            .parse()
            .unwrap();
        let features = Features::from_element(&elem).unwrap();
        assert_eq!(features, Features::default());
    }
}
