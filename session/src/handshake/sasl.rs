// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL mechanism selection and client-side driving.
//!
//! The XML framing of the exchange lives in the handshaker; this module
//! owns the mechanism clients and the credential plumbing around them.

use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::Credentials;

use jid::Jid;

use crate::error::{AuthError, Error};

/// The default mechanism preference, strongest first.
///
/// `SCRAM-SHA-512` is accepted in preference lists but no client exists
/// for it yet, so it never gets selected.
pub const DEFAULT_MECHANISMS: [&str; 3] = ["SCRAM-SHA-512", "SCRAM-SHA-256", "SCRAM-SHA-1"];

/// The key passed to a [`CredentialRetriever`] when a password is wanted.
pub const CREDENTIAL_PASSWORD: &str = "password";

/// Supplies secrets to the authentication machinery on demand.
///
/// `mechanism` is the SASL mechanism name the secret is for; `key` names
/// the kind of secret, currently always [`CREDENTIAL_PASSWORD`].
/// Returning `Ok(None)` makes the mechanism unavailable without failing
/// the handshake outright.
pub trait CredentialRetriever: Send + Sync + 'static {
    /// Retrieve the secret for `authn_id`, or `None` when unavailable.
    fn retrieve(
        &self,
        authn_id: &Jid,
        mechanism: &str,
        key: &str,
    ) -> Result<Option<String>, Error>;
}

/// A retriever that hands out one fixed password.
pub struct StaticPassword {
    password: String,
}

impl StaticPassword {
    /// Wrap a password.
    pub fn new(password: &str) -> StaticPassword {
        StaticPassword {
            password: password.to_owned(),
        }
    }
}

impl CredentialRetriever for StaticPassword {
    fn retrieve(
        &self,
        _authn_id: &Jid,
        _mechanism: &str,
        _key: &str,
    ) -> Result<Option<String>, Error> {
        Ok(Some(self.password.clone()))
    }
}

/// A running SASL exchange.
pub(crate) struct SaslNegotiation {
    name: String,
    client: Box<dyn Mechanism + Send + Sync>,
}

impl SaslNegotiation {
    /// The selected mechanism's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Answer a server challenge.
    pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.client.response(challenge).map_err(AuthError::Sasl)
    }

    /// Verify the server's success data.
    pub fn accept(&mut self, data: &[u8]) -> Result<(), AuthError> {
        self.client.success(data).map_err(AuthError::Sasl)
    }
}

/// Pick the first preferred mechanism the server offers and a client can
/// be built for. Returns the running negotiation together with the
/// initial response bytes, or `None` when nothing matches.
pub(crate) fn select_mechanism(
    offered: &[String],
    preference: &[String],
    authn_id: &Jid,
    retriever: &dyn CredentialRetriever,
) -> Result<Option<(SaslNegotiation, Vec<u8>)>, Error> {
    for name in preference {
        if !offered.iter().any(|offer| offer == name) {
            continue;
        }
        let client = match build_client(name, authn_id, retriever)? {
            Some(client) => client,
            None => continue,
        };
        let mut negotiation = SaslNegotiation {
            name: name.clone(),
            client,
        };
        let initial = negotiation.client.initial();
        log::debug!("selected SASL mechanism {}", name);
        return Ok(Some((negotiation, initial)));
    }
    Ok(None)
}

fn build_client(
    name: &str,
    authn_id: &Jid,
    retriever: &dyn CredentialRetriever,
) -> Result<Option<Box<dyn Mechanism + Send + Sync>>, Error> {
    match name {
        "SCRAM-SHA-256" | "SCRAM-SHA-1" | "PLAIN" => {
            let Some(username) = authn_id.local() else {
                log::debug!("{} needs a localpart to authenticate as", name);
                return Ok(None);
            };
            let Some(password) = retriever.retrieve(authn_id, name, CREDENTIAL_PASSWORD)? else {
                return Ok(None);
            };
            let credentials = Credentials::default()
                .with_username(username)
                .with_password(password);
            let client: Box<dyn Mechanism + Send + Sync> = match name {
                "SCRAM-SHA-256" => Box::new(
                    Scram::<Sha256>::from_credentials(credentials).map_err(AuthError::Sasl)?,
                ),
                "SCRAM-SHA-1" => Box::new(
                    Scram::<Sha1>::from_credentials(credentials).map_err(AuthError::Sasl)?,
                ),
                _ => Box::new(Plain::from_credentials(credentials).map_err(AuthError::Sasl)?),
            };
            Ok(Some(client))
        }
        "ANONYMOUS" => Ok(Some(Box::new(Anonymous::new()))),
        // No client for this mechanism (e.g. SCRAM-SHA-512).
        _ => Ok(None),
    }
}
