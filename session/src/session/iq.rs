// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Correlation of iq requests with their responses.

use core::future::Future;
use core::pin::Pin;
use core::task::{ready, Context, Poll};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;

use crate::error::Error;
use crate::stanza::{IqType, Stanza, StanzaKind};

/// What an iq query ultimately resolves to.
///
/// `Ok(Some(_))` carries the result stanza, `Ok(None)` means the session
/// ended before a reply arrived, `Err(Error::Stanza(_))` carries a
/// decoded iq error.
pub type IqOutcome = Result<Option<Stanza>, Error>;

type IqMap = BTreeMap<String, IqResponseSink>;

struct IqResponseSink {
    inner: oneshot::Sender<IqOutcome>,
}

struct IqMapEntryHandle {
    id: String,
    map: Weak<Mutex<IqMap>>,
}

impl Drop for IqMapEntryHandle {
    fn drop(&mut self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let Ok(mut map) = map.lock() else {
            return;
        };
        map.remove(&self.id);
    }
}

pin_project_lite::pin_project! {
    /// Future for an iq response.
    ///
    /// There is no internal timeout: if no reply ever arrives and the
    /// session stays up, the future stays pending; race it against a
    /// timer if needed. Dropping the token cancels the correlation; a
    /// late reply is then silently discarded.
    pub struct IqResponseToken {
        entry: Option<IqMapEntryHandle>,
        #[pin]
        inner: oneshot::Receiver<IqOutcome>,
    }
}

impl Future for IqResponseToken {
    type Output = IqOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        this.entry.take();
        Poll::Ready(match result {
            Ok(outcome) => outcome,
            // The tracker disappeared together with its session.
            Err(_) => Ok(None),
        })
    }
}

/// Tracks pending iq queries by id.
pub(crate) struct IqResponseTracker {
    map: Arc<Mutex<IqMap>>,
}

impl IqResponseTracker {
    pub fn new() -> IqResponseTracker {
        IqResponseTracker {
            map: Arc::new(Mutex::new(IqMap::new())),
        }
    }

    /// Register a pending query under `id`.
    pub fn allocate(&self, id: String) -> IqResponseToken {
        let (tx, rx) = oneshot::channel();
        let mut map = self.map.lock().unwrap();
        map.insert(id.clone(), IqResponseSink { inner: tx });
        IqResponseToken {
            entry: Some(IqMapEntryHandle {
                id,
                map: Arc::downgrade(&self.map),
            }),
            inner: rx,
        }
    }

    /// Drop the registration for `id`, e.g. because the request never
    /// made it onto the wire.
    pub fn forget(&self, id: &str) {
        self.map.lock().unwrap().remove(id);
    }

    /// Try to deliver a stanza as an iq response.
    ///
    /// Returns the stanza back if it is not a result/error iq matching a
    /// pending query.
    pub fn handle_response(&self, stanza: Stanza) -> Option<Stanza> {
        if stanza.kind() != StanzaKind::Iq {
            return Some(stanza);
        }
        let iq_type = match stanza.iq_type() {
            Some(iq_type @ (IqType::Result | IqType::Error)) => iq_type,
            _ => return Some(stanza),
        };
        let Some(id) = stanza.id().map(str::to_owned) else {
            return Some(stanza);
        };
        let sink = {
            let mut map = self.map.lock().unwrap();
            map.remove(&id)
        };
        match sink {
            None => {
                log::trace!("no pending iq query for id {:?}", id);
                Some(stanza)
            }
            Some(sink) => {
                let outcome = match iq_type {
                    IqType::Error => {
                        let error = stanza.error().unwrap_or_else(|| {
                            crate::stanza::error::StanzaError::new(
                                crate::stanza::error::ErrorType::Cancel,
                                crate::stanza::error::DefinedCondition::UndefinedCondition,
                                None,
                            )
                        });
                        Err(Error::Stanza(error))
                    }
                    _ => Ok(Some(stanza)),
                };
                let _: Result<_, _> = sink.inner.send(outcome);
                None
            }
        }
    }

    /// Complete every pending query empty; the session is over.
    pub fn complete_all_empty(&self) {
        let sinks: Vec<IqResponseSink> = {
            let mut map = self.map.lock().unwrap();
            let mut drained = Vec::with_capacity(map.len());
            while let Some((_, sink)) = map.pop_first() {
                drained.push(sink);
            }
            drained
        };
        for sink in sinks {
            let _: Result<_, _> = sink.inner.send(Ok(None));
        }
    }
}
