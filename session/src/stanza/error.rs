// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza-level errors, RFC 6120 section 8.3.

use core::fmt;
use std::collections::BTreeMap;
use std::error::Error as StdError;

use minidom::Element;

use jid::Jid;

use crate::error::ProtocolError;
use crate::ns;

/// The `type` attribute of a stanza error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials.
    Auth,
    /// Do not retry (the error cannot be remedied).
    Cancel,
    /// Proceed (the condition was only a warning).
    Continue,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after waiting (the error is temporary).
    Wait,
}

impl ErrorType {
    /// The wire form of this error type.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }

    fn from_attr(s: &str) -> Option<ErrorType> {
        match s {
            "auth" => Some(ErrorType::Auth),
            "cancel" => Some(ErrorType::Cancel),
            "continue" => Some(ErrorType::Continue),
            "modify" => Some(ErrorType::Modify),
            "wait" => Some(ErrorType::Wait),
            _ => None,
        }
    }
}

/// List of valid stanza error conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinedCondition {
    /// The sender has sent a stanza containing XML that does not conform
    /// to the appropriate schema or that cannot be processed.
    BadRequest,
    /// Access cannot be granted because an existing resource exists with
    /// the same name or address.
    Conflict,
    /// The feature is not implemented by the recipient or an intermediate
    /// server.
    FeatureNotImplemented,
    /// The requesting entity does not possess the necessary permissions.
    Forbidden,
    /// The recipient or server can no longer be contacted at this
    /// address, typically permanently, possibly naming a new address.
    Gone {
        /// The new address of the entity, if available.
        new_address: Option<String>,
    },
    /// The server has experienced a misconfiguration or other internal
    /// error.
    InternalServerError,
    /// The addressed JID or item cannot be found.
    ItemNotFound,
    /// The sending entity has communicated an XMPP address that violates
    /// the address format.
    JidMalformed,
    /// The request does not meet criteria defined by the recipient or
    /// server.
    NotAcceptable,
    /// No entity is allowed to perform the action.
    NotAllowed,
    /// The sender must provide proper credentials before being allowed to
    /// perform the action.
    NotAuthorized,
    /// The entity has violated some local service policy.
    PolicyViolation,
    /// The intended recipient is temporarily unavailable.
    RecipientUnavailable,
    /// Requests for this information are being redirected to another
    /// entity, typically temporarily.
    Redirect {
        /// The new address of the entity, if available.
        new_address: Option<String>,
    },
    /// Prior registration is necessary.
    RegistrationRequired,
    /// A remote server or service does not exist or cannot be resolved.
    RemoteServerNotFound,
    /// The remote server or service could not be contacted within a
    /// reasonable amount of time.
    RemoteServerTimeout,
    /// The server or recipient lacks the system resources necessary to
    /// service the request.
    ResourceConstraint,
    /// The server or recipient does not currently provide the requested
    /// service.
    ServiceUnavailable,
    /// A prior subscription is necessary.
    SubscriptionRequired,
    /// The condition is undefined or matches no other condition.
    UndefinedCondition,
    /// The recipient understood the request but was not expecting it at
    /// this time.
    UnexpectedRequest,
}

impl DefinedCondition {
    /// The element name of this condition.
    pub fn name(&self) -> &'static str {
        match self {
            DefinedCondition::BadRequest => "bad-request",
            DefinedCondition::Conflict => "conflict",
            DefinedCondition::FeatureNotImplemented => "feature-not-implemented",
            DefinedCondition::Forbidden => "forbidden",
            DefinedCondition::Gone { .. } => "gone",
            DefinedCondition::InternalServerError => "internal-server-error",
            DefinedCondition::ItemNotFound => "item-not-found",
            DefinedCondition::JidMalformed => "jid-malformed",
            DefinedCondition::NotAcceptable => "not-acceptable",
            DefinedCondition::NotAllowed => "not-allowed",
            DefinedCondition::NotAuthorized => "not-authorized",
            DefinedCondition::PolicyViolation => "policy-violation",
            DefinedCondition::RecipientUnavailable => "recipient-unavailable",
            DefinedCondition::Redirect { .. } => "redirect",
            DefinedCondition::RegistrationRequired => "registration-required",
            DefinedCondition::RemoteServerNotFound => "remote-server-not-found",
            DefinedCondition::RemoteServerTimeout => "remote-server-timeout",
            DefinedCondition::ResourceConstraint => "resource-constraint",
            DefinedCondition::ServiceUnavailable => "service-unavailable",
            DefinedCondition::SubscriptionRequired => "subscription-required",
            DefinedCondition::UndefinedCondition => "undefined-condition",
            DefinedCondition::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The redirect URI carried by `gone` or `redirect`, if any.
    pub fn new_address(&self) -> Option<&str> {
        match self {
            DefinedCondition::Gone { new_address }
            | DefinedCondition::Redirect { new_address } => new_address.as_deref(),
            _ => None,
        }
    }

    fn from_element(element: &Element) -> Option<DefinedCondition> {
        if element.ns() != ns::XMPP_STANZAS {
            return None;
        }
        let text_or_none = || {
            let text = element.text();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        };
        Some(match element.name() {
            "bad-request" => DefinedCondition::BadRequest,
            "conflict" => DefinedCondition::Conflict,
            "feature-not-implemented" => DefinedCondition::FeatureNotImplemented,
            "forbidden" => DefinedCondition::Forbidden,
            "gone" => DefinedCondition::Gone {
                new_address: text_or_none(),
            },
            "internal-server-error" => DefinedCondition::InternalServerError,
            "item-not-found" => DefinedCondition::ItemNotFound,
            "jid-malformed" => DefinedCondition::JidMalformed,
            "not-acceptable" => DefinedCondition::NotAcceptable,
            "not-allowed" => DefinedCondition::NotAllowed,
            "not-authorized" => DefinedCondition::NotAuthorized,
            "policy-violation" => DefinedCondition::PolicyViolation,
            "recipient-unavailable" => DefinedCondition::RecipientUnavailable,
            "redirect" => DefinedCondition::Redirect {
                new_address: text_or_none(),
            },
            "registration-required" => DefinedCondition::RegistrationRequired,
            "remote-server-not-found" => DefinedCondition::RemoteServerNotFound,
            "remote-server-timeout" => DefinedCondition::RemoteServerTimeout,
            "resource-constraint" => DefinedCondition::ResourceConstraint,
            "service-unavailable" => DefinedCondition::ServiceUnavailable,
            "subscription-required" => DefinedCondition::SubscriptionRequired,
            "undefined-condition" => DefinedCondition::UndefinedCondition,
            "unexpected-request" => DefinedCondition::UnexpectedRequest,
            _ => return None,
        })
    }

    fn to_element(&self) -> Element {
        let mut builder = Element::builder(self.name(), ns::XMPP_STANZAS);
        if let Some(address) = self.new_address() {
            builder = builder.append(address.to_owned());
        }
        builder.build()
    }
}

/// A stanza-level error.
///
/// Stanza errors are never terminal for the session; they surface as the
/// failure value of the iq query that triggered them.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// How the sender should react.
    pub error_type: ErrorType,
    /// The defined condition.
    pub condition: DefinedCondition,
    /// Optional human-readable texts, keyed by `xml:lang`.
    pub texts: BTreeMap<String, String>,
    /// The entity that reported the error, when it is not the stanza's
    /// addressee.
    pub by: Option<Jid>,
    /// Application-specific condition elements.
    pub application_specific: Vec<Element>,
}

impl StanzaError {
    /// Build a stanza error with a single untagged text.
    pub fn new(error_type: ErrorType, condition: DefinedCondition, text: Option<&str>) -> Self {
        let mut texts = BTreeMap::new();
        if let Some(text) = text {
            texts.insert(String::new(), text.to_owned());
        }
        StanzaError {
            error_type,
            condition,
            texts,
            by: None,
            application_specific: Vec::new(),
        }
    }

    /// Decode an `<error/>` element.
    pub fn from_element(element: &Element) -> Result<StanzaError, ProtocolError> {
        let error_type = element
            .attr("type")
            .and_then(ErrorType::from_attr)
            .ok_or_else(|| ProtocolError::UnexpectedElement {
                name: element.name().to_owned(),
                ns: element.ns(),
            })?;
        let by = element.attr("by").and_then(|s| Jid::new(s).ok());
        let mut condition = None;
        let mut texts = BTreeMap::new();
        let mut application_specific = Vec::new();
        for child in element.children() {
            if child.is("text", ns::XMPP_STANZAS) {
                let lang = child.attr("xml:lang").unwrap_or("").to_owned();
                texts.insert(lang, child.text());
            } else if let Some(defined) = DefinedCondition::from_element(child) {
                condition = Some(defined);
            } else {
                application_specific.push(child.clone());
            }
        }
        Ok(StanzaError {
            error_type,
            condition: condition.unwrap_or(DefinedCondition::UndefinedCondition),
            texts,
            by,
            application_specific,
        })
    }

    /// Serialize into an `<error/>` element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", self.error_type.as_str());
        if let Some(by) = &self.by {
            builder = builder.attr("by", by.to_string());
        }
        builder = builder.append(self.condition.to_element());
        for (lang, text) in &self.texts {
            let mut text_builder =
                Element::builder("text", ns::XMPP_STANZAS).append(text.clone());
            if !lang.is_empty() {
                text_builder = text_builder.attr("xml:lang", lang.as_str());
            }
            builder = builder.append(text_builder.build());
        }
        let mut element = builder.build();
        for extra in &self.application_specific {
            element.append_child(extra.clone());
        }
        element
    }

    /// The first human-readable text, if any.
    pub fn text(&self) -> Option<&str> {
        self.texts.values().next().map(String::as_str)
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{} ({})",
            self.condition.name(),
            self.error_type.as_str()
        )?;
        if let Some(text) = self.text() {
            write!(fmt, ": {}", text)?;
        }
        Ok(())
    }
}

impl StdError for StanzaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_service_unavailable() {
        let elem: Element = "<error xmlns='jabber:client' type='cancel'>
                <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>
            </error>"
            .parse()
            .unwrap();
        let error = StanzaError::from_element(&elem).unwrap();
        assert_eq!(error.error_type, ErrorType::Cancel);
        assert_eq!(error.condition, DefinedCondition::ServiceUnavailable);
        assert!(error.texts.is_empty());
    }

    #[test]
    fn decode_with_text_and_by() {
        let elem: Element = "<error xmlns='jabber:client' type='wait' by='example.org'>
                <resource-constraint xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>
                <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas' xml:lang='en'>slow down</text>
            </error>"
            .parse()
            .unwrap();
        let error = StanzaError::from_element(&elem).unwrap();
        assert_eq!(error.condition, DefinedCondition::ResourceConstraint);
        assert_eq!(error.text(), Some("slow down"));
        assert_eq!(error.by.as_ref().unwrap().domain(), "example.org");
    }

    #[test]
    fn decode_redirect_address() {
        let elem: Element = "<error xmlns='jabber:client' type='modify'>
                <redirect xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>xmpp:other.example.org</redirect>
            </error>"
            .parse()
            .unwrap();
        let error = StanzaError::from_element(&elem).unwrap();
        assert_eq!(
            error.condition.new_address(),
            Some("xmpp:other.example.org")
        );
    }

    #[test]
    fn unknown_condition_maps_to_undefined() {
        let elem: Element = "<error xmlns='jabber:client' type='cancel'>
                <mystery xmlns='urn:example:app'/>
            </error>"
            .parse()
            .unwrap();
        let error = StanzaError::from_element(&elem).unwrap();
        assert_eq!(error.condition, DefinedCondition::UndefinedCondition);
        assert_eq!(error.application_specific.len(), 1);
    }

    #[test]
    fn round_trip() {
        let error = StanzaError::new(
            ErrorType::Cancel,
            DefinedCondition::FeatureNotImplemented,
            Some("no such handler"),
        );
        let decoded = StanzaError::from_element(&error.to_element()).unwrap();
        assert_eq!(decoded, error);
    }
}
