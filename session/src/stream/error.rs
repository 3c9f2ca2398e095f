// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream-level errors, RFC 6120 section 4.9.
//!
//! Stream errors are terminal: after one is sent or received, no further
//! stanzas are accepted for transmission and the stream is closed.

use core::fmt;
use std::error::Error as StdError;

use minidom::Element;

use crate::ns;

/// Enumeration of all stream error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinedCondition {
    /// The entity has sent XML that cannot be processed.
    BadFormat,
    /// An unsupported or missing namespace prefix.
    BadNamespacePrefix,
    /// A new stream conflicts with an existing stream for this entity.
    Conflict,
    /// The peer has not responded to data sent over the stream.
    ConnectionTimeout,
    /// The addressed FQDN is no longer serviced by the receiving entity.
    HostGone,
    /// The addressed FQDN is not serviced by the receiving entity.
    HostUnknown,
    /// A stanza between servers lacks proper addressing.
    ImproperAddressing,
    /// The server has experienced an internal error.
    InternalServerError,
    /// The `from` attribute does not match an authorized JID.
    InvalidFrom,
    /// The stream or content namespace is not supported.
    InvalidNamespace,
    /// The entity has sent invalid XML to a validating receiver.
    InvalidXml,
    /// The entity attempted to send data before authenticating.
    NotAuthorized,
    /// The entity has sent XML that is not well-formed.
    NotWellFormed,
    /// The entity has violated some local service policy.
    PolicyViolation,
    /// A connection required to fulfil the request could not be made.
    RemoteConnectionFailed,
    /// The stream is being reset; renegotiation from the top is required.
    Reset,
    /// The server lacks the resources to service the stream.
    ResourceConstraint,
    /// The entity has attempted to send restricted XML features.
    RestrictedXml,
    /// The entity should retry at a different host, named in the text.
    SeeOtherHost,
    /// The server is being shut down.
    SystemShutdown,
    /// An error not covered by the other conditions.
    UndefinedCondition,
    /// The text encoding is not supported.
    UnsupportedEncoding,
    /// A mandatory stream feature cannot be negotiated.
    UnsupportedFeature,
    /// A first-level child of the stream is not supported.
    UnsupportedStanzaType,
    /// The stream version is not supported.
    UnsupportedVersion,
}

impl DefinedCondition {
    /// The element name of this condition.
    pub fn name(self) -> &'static str {
        match self {
            DefinedCondition::BadFormat => "bad-format",
            DefinedCondition::BadNamespacePrefix => "bad-namespace-prefix",
            DefinedCondition::Conflict => "conflict",
            DefinedCondition::ConnectionTimeout => "connection-timeout",
            DefinedCondition::HostGone => "host-gone",
            DefinedCondition::HostUnknown => "host-unknown",
            DefinedCondition::ImproperAddressing => "improper-addressing",
            DefinedCondition::InternalServerError => "internal-server-error",
            DefinedCondition::InvalidFrom => "invalid-from",
            DefinedCondition::InvalidNamespace => "invalid-namespace",
            DefinedCondition::InvalidXml => "invalid-xml",
            DefinedCondition::NotAuthorized => "not-authorized",
            DefinedCondition::NotWellFormed => "not-well-formed",
            DefinedCondition::PolicyViolation => "policy-violation",
            DefinedCondition::RemoteConnectionFailed => "remote-connection-failed",
            DefinedCondition::Reset => "reset",
            DefinedCondition::ResourceConstraint => "resource-constraint",
            DefinedCondition::RestrictedXml => "restricted-xml",
            DefinedCondition::SeeOtherHost => "see-other-host",
            DefinedCondition::SystemShutdown => "system-shutdown",
            DefinedCondition::UndefinedCondition => "undefined-condition",
            DefinedCondition::UnsupportedEncoding => "unsupported-encoding",
            DefinedCondition::UnsupportedFeature => "unsupported-feature",
            DefinedCondition::UnsupportedStanzaType => "unsupported-stanza-type",
            DefinedCondition::UnsupportedVersion => "unsupported-version",
        }
    }

    fn from_name(name: &str) -> Option<DefinedCondition> {
        Some(match name {
            "bad-format" => DefinedCondition::BadFormat,
            "bad-namespace-prefix" => DefinedCondition::BadNamespacePrefix,
            "conflict" => DefinedCondition::Conflict,
            "connection-timeout" => DefinedCondition::ConnectionTimeout,
            "host-gone" => DefinedCondition::HostGone,
            "host-unknown" => DefinedCondition::HostUnknown,
            "improper-addressing" => DefinedCondition::ImproperAddressing,
            "internal-server-error" => DefinedCondition::InternalServerError,
            "invalid-from" => DefinedCondition::InvalidFrom,
            "invalid-namespace" => DefinedCondition::InvalidNamespace,
            "invalid-xml" => DefinedCondition::InvalidXml,
            "not-authorized" => DefinedCondition::NotAuthorized,
            "not-well-formed" => DefinedCondition::NotWellFormed,
            "policy-violation" => DefinedCondition::PolicyViolation,
            "remote-connection-failed" => DefinedCondition::RemoteConnectionFailed,
            "reset" => DefinedCondition::Reset,
            "resource-constraint" => DefinedCondition::ResourceConstraint,
            "restricted-xml" => DefinedCondition::RestrictedXml,
            "see-other-host" => DefinedCondition::SeeOtherHost,
            "system-shutdown" => DefinedCondition::SystemShutdown,
            "undefined-condition" => DefinedCondition::UndefinedCondition,
            "unsupported-encoding" => DefinedCondition::UnsupportedEncoding,
            "unsupported-feature" => DefinedCondition::UnsupportedFeature,
            "unsupported-stanza-type" => DefinedCondition::UnsupportedStanzaType,
            "unsupported-version" => DefinedCondition::UnsupportedVersion,
            _ => return None,
        })
    }
}

/// A stream-level error element.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    /// The defined condition.
    pub condition: DefinedCondition,
    /// Optional human-readable text.
    pub text: Option<String>,
    /// Optional application-specific condition elements.
    pub application_specific: Vec<Element>,
}

impl StreamError {
    /// Build a stream error from a condition alone.
    pub fn new(condition: DefinedCondition) -> StreamError {
        StreamError {
            condition,
            text: None,
            application_specific: Vec::new(),
        }
    }

    /// Attach a human-readable text.
    pub fn with_text(mut self, text: &str) -> StreamError {
        self.text = Some(text.to_owned());
        self
    }

    /// Whether a document is a stream error element.
    pub fn is_stream_error(element: &Element) -> bool {
        element.is("error", ns::STREAM)
    }

    /// Decode an `<error/>` document received on the stream.
    pub fn from_element(element: &Element) -> Option<StreamError> {
        if !StreamError::is_stream_error(element) {
            return None;
        }
        let mut condition = DefinedCondition::UndefinedCondition;
        let mut text = None;
        let mut application_specific = Vec::new();
        for child in element.children() {
            if child.is("text", ns::XMPP_STREAMS) {
                text = Some(child.text());
            } else if child.ns() == ns::XMPP_STREAMS {
                if let Some(defined) = DefinedCondition::from_name(child.name()) {
                    condition = defined;
                }
            } else {
                application_specific.push(child.clone());
            }
        }
        Some(StreamError {
            condition,
            text,
            application_specific,
        })
    }

    /// Serialize into the `<error/>` document to send on the stream.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::STREAM)
            .append(Element::builder(self.condition.name(), ns::XMPP_STREAMS).build());
        if let Some(text) = &self.text {
            builder = builder
                .append(Element::builder("text", ns::XMPP_STREAMS).append(text.clone()).build());
        }
        let mut element = builder.build();
        for extra in &self.application_specific {
            element.append_child(extra.clone());
        }
        element
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.condition.name())?;
        if let Some(text) = &self.text {
            write!(fmt, ": {}", text)?;
        }
        Ok(())
    }
}

impl StdError for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_condition_and_text() {
        let error = StreamError::new(DefinedCondition::InvalidXml).with_text("boom");
        let element = error.to_element();
        assert!(StreamError::is_stream_error(&element));
        assert!(element
            .get_child("invalid-xml", ns::XMPP_STREAMS)
            .is_some());
        assert_eq!(
            element.get_child("text", ns::XMPP_STREAMS).unwrap().text(),
            "boom"
        );
    }

    #[test]
    fn round_trip() {
        let error = StreamError::new(DefinedCondition::SeeOtherHost).with_text("other.example.org");
        let decoded = StreamError::from_element(&error.to_element()).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn unknown_condition_decodes_as_undefined() {
        let elem: Element = "<stream:error xmlns:stream='http://etherx.jabber.org/streams'>
                <brand-new xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>
            </stream:error>"
            .parse()
            .unwrap();
        let decoded = StreamError::from_element(&elem).unwrap();
        assert_eq!(decoded.condition, DefinedCondition::UndefinedCondition);
    }

    #[test]
    fn non_error_documents_are_rejected() {
        let elem: Element = "<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>"
            .parse()
            .unwrap();
        assert!(StreamError::from_element(&elem).is_none());
    }
}
