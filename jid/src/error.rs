// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::error::Error as StdError;

/// An error that can occur parsing or building a JID.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// The domainpart is empty, or the string started with `@` or `/`.
    NoDomain,

    /// An `@` was present but the localpart before it is empty.
    EmptyLocal,

    /// A `/` was present but the resourcepart after it is empty.
    EmptyResource,

    /// The localpart is longer than 1023 bytes.
    LocalTooLong,

    /// The domainpart is longer than 1023 bytes.
    DomainTooLong,

    /// The resourcepart is longer than 1023 bytes.
    ResourceTooLong,

    /// The localpart contains a character forbidden in localparts.
    ForbiddenChars,

    /// The localpart failed the localpart string preparation profile.
    LocalPrep,

    /// The domainpart failed the domainpart string preparation profile.
    NamePrep,

    /// The resourcepart failed the resourcepart string preparation profile.
    ResourcePrep,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match self {
            Error::NoDomain => "no domain found in this JID",
            Error::EmptyLocal => "localpart empty despite the presence of a @",
            Error::EmptyResource => "resourcepart empty despite the presence of a /",
            Error::LocalTooLong => "localpart longer than 1023 bytes",
            Error::DomainTooLong => "domainpart longer than 1023 bytes",
            Error::ResourceTooLong => "resourcepart longer than 1023 bytes",
            Error::ForbiddenChars => "localpart contains a forbidden character",
            Error::LocalPrep => "localpart stringprep failed",
            Error::NamePrep => "domainpart stringprep failed",
            Error::ResourcePrep => "resourcepart stringprep failed",
        })
    }
}

impl StdError for Error {}
