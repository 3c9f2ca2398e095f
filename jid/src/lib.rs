// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Represents XMPP addresses, also known as JIDs.
//!
//! A JID is the triple `[local@]domain[/resource]`, where the local and
//! resource parts are optional. Parsing normalizes each part through its
//! stringprep profile, so two JIDs that differ only in case or Unicode
//! form compare equal.

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

use core::fmt;
use core::num::NonZeroU16;
use core::str::FromStr;

use memchr::memchr;

mod error;

pub use crate::error::Error;

/// Maximum length of a single JID part, in bytes, after normalization.
const MAX_PART_LEN: usize = 1023;

/// Characters that must not appear in a localpart, on top of what the
/// stringprep profile already rejects.
const FORBIDDEN_IN_LOCAL: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@'];

/// An XMPP address.
///
/// The string is stored in normalized form; `at` and `slash` are the byte
/// offsets of the separators, when present. Neither separator can sit at
/// offset zero (a leading `@` or `/` is a parse error), which is what makes
/// `NonZeroU16` fit.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Jid {
    normalized: String,
    at: Option<NonZeroU16>,
    slash: Option<NonZeroU16>,
}

impl Jid {
    /// Parse a JID from its string representation.
    ///
    /// The legacy bracketed form `<jid>` is accepted and stripped.
    pub fn new(unnormalized: &str) -> Result<Jid, Error> {
        let unnormalized = strip_brackets(unnormalized);
        let bytes = unnormalized.as_bytes();

        let (bare, resource) = match memchr(b'/', bytes) {
            Some(0) => return Err(Error::NoDomain),
            Some(slash) => {
                let resource = &unnormalized[slash + 1..];
                if resource.is_empty() {
                    return Err(Error::EmptyResource);
                }
                (&unnormalized[..slash], Some(resource))
            }
            None => (unnormalized, None),
        };

        let (local, domain) = match memchr(b'@', bare.as_bytes()) {
            Some(0) => return Err(Error::EmptyLocal),
            Some(at) => (Some(&bare[..at]), &bare[at + 1..]),
            None => (None, bare),
        };

        Jid::from_parts(local, domain, resource)
    }

    /// Build a JID from its individual parts.
    ///
    /// `local` and `resource` may be absent; empty strings are treated the
    /// same as absent parts. The domain is required.
    pub fn from_parts(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Jid, Error> {
        let local = local.filter(|l| !l.is_empty());
        let resource = resource.filter(|r| !r.is_empty());

        let local = local.map(prep_local).transpose()?;
        let domain = prep_domain(domain)?;
        let resource = resource.map(prep_resource).transpose()?;

        let mut normalized = String::with_capacity(
            local.as_deref().map(|l| l.len() + 1).unwrap_or(0)
                + domain.len()
                + resource.as_deref().map(|r| r.len() + 1).unwrap_or(0),
        );
        let at = match local {
            Some(local) => {
                normalized.push_str(&local);
                let at = NonZeroU16::new(normalized.len() as u16);
                normalized.push('@');
                at
            }
            None => None,
        };
        normalized.push_str(&domain);
        let slash = match resource {
            Some(resource) => {
                let slash = NonZeroU16::new(normalized.len() as u16);
                normalized.push('/');
                normalized.push_str(&resource);
                slash
            }
            None => None,
        };

        Ok(Jid {
            normalized,
            at,
            slash,
        })
    }

    /// The localpart, if present.
    pub fn local(&self) -> Option<&str> {
        self.at.map(|at| &self.normalized[..at.get() as usize])
    }

    /// The domainpart. Always present.
    pub fn domain(&self) -> &str {
        let start = self.at.map(|at| at.get() as usize + 1).unwrap_or(0);
        let end = self
            .slash
            .map(|slash| slash.get() as usize)
            .unwrap_or(self.normalized.len());
        &self.normalized[start..end]
    }

    /// The resourcepart, if present.
    pub fn resource(&self) -> Option<&str> {
        self.slash
            .map(|slash| &self.normalized[slash.get() as usize + 1..])
    }

    /// Whether this JID has no resourcepart.
    pub fn is_bare(&self) -> bool {
        self.slash.is_none()
    }

    /// Whether this JID has a resourcepart.
    pub fn is_full(&self) -> bool {
        self.slash.is_some()
    }

    /// Return this JID without its resourcepart.
    ///
    /// When there is no resourcepart, this is a plain clone.
    pub fn to_bare(&self) -> Jid {
        match self.slash {
            None => self.clone(),
            Some(slash) => Jid {
                normalized: self.normalized[..slash.get() as usize].to_owned(),
                at: self.at,
                slash: None,
            },
        }
    }

    /// Return a new JID with the given resourcepart, replacing any
    /// existing one.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, Error> {
        Jid::from_parts(self.local(), self.domain(), Some(resource))
    }

    /// The normalized string form, `[local@]domain[/resource]`.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::new(s)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.normalized)
    }
}

impl fmt::Debug for Jid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Jid({})", self.normalized)
    }
}

fn strip_brackets(s: &str) -> &str {
    match s.strip_prefix('<') {
        Some(inner) => inner.strip_suffix('>').unwrap_or(inner),
        None => s,
    }
}

fn prep_local(local: &str) -> Result<String, Error> {
    if local.contains(FORBIDDEN_IN_LOCAL) {
        return Err(Error::ForbiddenChars);
    }
    let local = stringprep::nodeprep(local).map_err(|_| Error::LocalPrep)?;
    if local.is_empty() {
        return Err(Error::EmptyLocal);
    }
    if local.len() > MAX_PART_LEN {
        return Err(Error::LocalTooLong);
    }
    Ok(local.into_owned())
}

fn prep_domain(domain: &str) -> Result<String, Error> {
    // A trailing dot is allowed on the wire but not significant.
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    let domain = stringprep::nameprep(domain).map_err(|_| Error::NamePrep)?;
    if domain.is_empty() {
        return Err(Error::NoDomain);
    }
    if domain.len() > MAX_PART_LEN {
        return Err(Error::DomainTooLong);
    }
    Ok(domain.into_owned())
}

fn prep_resource(resource: &str) -> Result<String, Error> {
    let resource = stringprep::resourceprep(resource).map_err(|_| Error::ResourcePrep)?;
    if resource.is_empty() {
        return Err(Error::EmptyResource);
    }
    if resource.len() > MAX_PART_LEN {
        return Err(Error::ResourceTooLong);
    }
    Ok(resource.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jid() {
        let jid = Jid::new("alice@example.org/tablet").unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), Some("tablet"));
        assert_eq!(jid.to_string(), "alice@example.org/tablet");
        assert!(jid.is_full());
    }

    #[test]
    fn bare_jid() {
        let jid = Jid::new("alice@example.org").unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), None);
        assert!(jid.is_bare());
    }

    #[test]
    fn domain_only() {
        let jid = Jid::new("example.org").unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn domain_with_resource() {
        let jid = Jid::new("example.org/bot").unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), Some("bot"));
    }

    #[test]
    fn bracketed_form() {
        let jid = Jid::new("<alice@example.org>").unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.to_bare().local(), Some("alice"));
    }

    #[test]
    fn to_bare() {
        let jid = Jid::new("alice@example.org/tablet").unwrap();
        let bare = jid.to_bare();
        assert_eq!(bare.to_string(), "alice@example.org");
        assert_eq!(bare.local(), jid.local());
        assert_eq!(bare.domain(), jid.domain());
        assert_eq!(bare.resource(), None);
        // Already-bare JIDs stay identical.
        assert_eq!(bare.to_bare(), bare);
    }

    #[test]
    fn resource_may_contain_slashes() {
        let jid = Jid::new("alice@example.org/one/two").unwrap();
        assert_eq!(jid.resource(), Some("one/two"));
    }

    #[test]
    fn case_normalization() {
        let a = Jid::new("ALICE@Example.ORG").unwrap();
        let b = Jid::new("alice@example.org").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "alice@example.org");
    }

    #[test]
    fn round_trip_canonical() {
        for s in ["alice@example.org/tablet", "alice@example.org", "example.org"] {
            assert_eq!(Jid::new(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn leading_separators_rejected() {
        assert_eq!(Jid::new("@example.org"), Err(Error::EmptyLocal));
        assert_eq!(Jid::new("/resource"), Err(Error::NoDomain));
        assert_eq!(Jid::new(""), Err(Error::NoDomain));
    }

    #[test]
    fn empty_resource_rejected() {
        assert_eq!(Jid::new("alice@example.org/"), Err(Error::EmptyResource));
    }

    #[test]
    fn forbidden_chars_in_local() {
        assert_eq!(Jid::new("al:ce@example.org"), Err(Error::ForbiddenChars));
        assert_eq!(Jid::new("al<ce@example.org"), Err(Error::ForbiddenChars));
    }

    #[test]
    fn oversized_parts_rejected() {
        let local = "a".repeat(1024);
        assert_eq!(
            Jid::new(&format!("{}@example.org", local)),
            Err(Error::LocalTooLong)
        );
        let resource = "r".repeat(1024);
        assert_eq!(
            Jid::new(&format!("alice@example.org/{}", resource)),
            Err(Error::ResourceTooLong)
        );
    }

    #[test]
    fn from_parts() {
        let jid = Jid::from_parts(Some("alice"), "example.org", Some("tablet")).unwrap();
        assert_eq!(jid.to_string(), "alice@example.org/tablet");
        let bare = Jid::from_parts(None, "example.org", None).unwrap();
        assert_eq!(bare.to_string(), "example.org");
        assert_eq!(
            Jid::from_parts(Some("alice"), "", None),
            Err(Error::NoDomain)
        );
    }

    #[test]
    fn with_resource() {
        let bare = Jid::new("alice@example.org").unwrap();
        let full = bare.with_resource("rand-42").unwrap();
        assert_eq!(full.to_string(), "alice@example.org/rand-42");
    }
}
