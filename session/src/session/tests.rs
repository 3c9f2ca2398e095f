// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session tests against a scripted in-memory transport.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use minidom::Element;
use tokio::sync::broadcast;

use jid::Jid;

use crate::error::Error;
use crate::handshake::StaticPassword;
use crate::ns;
use crate::stream;
use crate::transport::Transport;

use super::*;

/// A transport whose "server" answers from a fixed script: PLAIN auth,
/// binding under the requested (or a generated) resource, and canned
/// replies for a couple of well-known queries.
struct MockTransport {
    session: Mutex<Option<Session>>,
    shutdown: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl MockTransport {
    fn new() -> Arc<MockTransport> {
        Arc::new(MockTransport {
            session: Mutex::new(None),
            shutdown: Mutex::new(None),
        })
    }

    fn attach(&self, session: Session) {
        *self.session.lock().unwrap() = Some(session);
    }
}

impl Transport for MockTransport {
    fn open(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let session = self
                .session
                .lock()
                .unwrap()
                .clone()
                .expect("session attached before login");
            let outbound = session.outbound_documents();
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            *self.shutdown.lock().unwrap() = Some(shutdown_tx);
            tokio::spawn(run_server(session, outbound, shutdown_rx));
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
                let _ = shutdown.send(true);
            }
            Ok(())
        })
    }

    fn start_tls(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move { Ok(()) })
    }
}

fn feed(session: &Session, xml: &str) {
    let element: Element = xml.parse().unwrap();
    let _ = session.feed(element);
}

async fn run_server(
    session: Session,
    mut outbound: broadcast::Receiver<Element>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut authenticated = false;
    loop {
        let doc = tokio::select! {
            received = outbound.recv() => match received {
                Ok(doc) => doc,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        };
        if stream::is_open(&doc) {
            feed(
                &session,
                "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'
                    from='example.org' version='1.0' id='mock-1'/>",
            );
            if authenticated {
                feed(
                    &session,
                    "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>
                        <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>
                    </stream:features>",
                );
            } else {
                feed(
                    &session,
                    "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>
                        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>
                            <mechanism>PLAIN</mechanism>
                        </mechanisms>
                    </stream:features>",
                );
            }
        } else if doc.is("auth", ns::SASL) {
            authenticated = true;
            feed(&session, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        } else if doc.name() == "iq"
            && doc.attr("type") == Some("set")
            && doc.get_child("bind", ns::BIND).is_some()
        {
            let id = doc.attr("id").unwrap_or("").to_owned();
            let resource = doc
                .get_child("bind", ns::BIND)
                .and_then(|bind| bind.get_child("resource", ns::BIND))
                .map(|resource| resource.text())
                .unwrap_or_else(|| "mock-resource".to_owned());
            feed(
                &session,
                &format!(
                    "<iq xmlns='jabber:client' type='result' id='{id}'>
                        <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>
                            <jid>alice@example.org/{resource}</jid>
                        </bind>
                    </iq>"
                ),
            );
        } else if doc.name() == "iq" && doc.attr("type") == Some("get") {
            let id = doc.attr("id").unwrap_or("").to_owned();
            if doc.get_child("query", ns::DISCO_INFO).is_some() {
                feed(
                    &session,
                    &format!(
                        "<iq xmlns='jabber:client' type='result' id='{id}' from='example.org'>
                            <query xmlns='http://jabber.org/protocol/disco#info'>
                                <identity category='server' type='im'/>
                                <feature var='urn:xmpp:ping'/>
                            </query>
                        </iq>"
                    ),
                );
            } else if doc.get_child("query", "urn:example:missing").is_some() {
                feed(
                    &session,
                    &format!(
                        "<iq xmlns='jabber:client' type='error' id='{id}' from='example.org'>
                            <error type='cancel'>
                                <service-unavailable
                                    xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>
                            </error>
                        </iq>"
                    ),
                );
            }
        } else if stream::is_close(&doc) {
            feed(&session, "<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>");
        }
    }
}

fn new_session() -> Session {
    let transport = MockTransport::new();
    let session = Session::new(Jid::new("alice@example.org").unwrap(), transport.clone());
    transport.attach(session.clone());
    session
}

fn plain_options() -> LoginOptions {
    LoginOptions {
        mechanisms: Some(vec!["PLAIN".to_owned()]),
        ..LoginOptions::default()
    }
}

async fn login(session: &Session) -> Jid {
    session
        .login_with(Arc::new(StaticPassword::new("secret")), plain_options())
        .await
        .expect("login against the mock server succeeds")
}

#[tokio::test]
async fn login_reaches_online() {
    let session = new_session();
    let jid = login(&session).await;
    assert_eq!(jid.to_string(), "alice@example.org/mock-resource");
    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(session.bound_jid().unwrap(), jid);
}

#[tokio::test]
async fn login_requests_preset_resource() {
    let session = new_session();
    let options = LoginOptions {
        resource: Some("tablet".to_owned()),
        ..plain_options()
    };
    let jid = session
        .login_with(Arc::new(StaticPassword::new("secret")), options)
        .await
        .unwrap();
    assert_eq!(jid.to_string(), "alice@example.org/tablet");
}

#[tokio::test]
async fn login_twice_is_a_state_violation() {
    let session = new_session();
    login(&session).await;
    let result = session
        .login_with(Arc::new(StaticPassword::new("secret")), plain_options())
        .await;
    assert!(matches!(result, Err(Error::State(_))));
    assert_eq!(session.state(), SessionState::Online);
}

#[tokio::test]
async fn state_changes_are_emitted_in_order() {
    let session = new_session();
    let mut events = session.events();
    login(&session).await;
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        [
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Handshaking,
            SessionState::Online,
        ]
    );
}

#[tokio::test]
async fn send_is_rejected_while_disconnected() {
    let session = new_session();
    let message: Element = "<message xmlns='jabber:client' to='bob@example.org'/>"
        .parse()
        .unwrap();
    assert!(matches!(session.send(message), Err(Error::State(_))));
}

#[tokio::test]
async fn send_assigns_ids_while_online() {
    let session = new_session();
    login(&session).await;
    let mut outbound = session.outbound_documents();
    let message: Element = "<message xmlns='jabber:client' to='bob@example.org'/>"
        .parse()
        .unwrap();
    let receipt = session.send(message).unwrap();
    assert!(receipt.acknowledgment.is_none());
    let sent = outbound.recv().await.unwrap();
    assert_eq!(sent.name(), "message");
    assert!(!sent.attr("id").unwrap().is_empty());
}

#[tokio::test]
async fn iq_query_round_trip() {
    let session = new_session();
    login(&session).await;
    let target = Jid::new("example.org").unwrap();
    let receipt = session
        .send_iq_query(ns::DISCO_INFO, Some(&target), None)
        .unwrap();
    let stanza = receipt.response.await.unwrap().unwrap();
    let query = stanza.payload().unwrap();
    assert!(query.is("query", ns::DISCO_INFO));
    let identities: Vec<_> = query
        .children()
        .filter(|child| child.name() == "identity")
        .collect();
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].attr("category"), Some("server"));
    let features: Vec<_> = query
        .children()
        .filter(|child| child.name() == "feature")
        .collect();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].attr("var"), Some("urn:xmpp:ping"));
}

#[tokio::test]
async fn iq_error_resolves_as_stanza_error() {
    let session = new_session();
    login(&session).await;
    let target = Jid::new("example.org").unwrap();
    let receipt = session
        .send_iq_query("urn:example:missing", Some(&target), None)
        .unwrap();
    match receipt.response.await {
        Err(Error::Stanza(error)) => {
            assert_eq!(error.error_type, crate::stanza::error::ErrorType::Cancel);
            assert_eq!(
                error.condition,
                crate::stanza::error::DefinedCondition::ServiceUnavailable
            );
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    // Stanza errors are not terminal for the session.
    assert_eq!(session.state(), SessionState::Online);
}

#[tokio::test]
async fn disconnect_completes_pending_queries_empty() {
    let session = new_session();
    login(&session).await;
    let receipt = session
        .send_iq_query("urn:example:void", None, None)
        .unwrap();
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(receipt.response.await.unwrap().is_none());
    // Idempotent.
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn relogin_after_disconnect() {
    let session = new_session();
    login(&session).await;
    session.disconnect().await.unwrap();
    let jid = login(&session).await;
    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(session.bound_jid().unwrap(), jid);
}

#[tokio::test]
async fn unknown_inbound_iq_gets_feature_not_implemented() {
    let session = new_session();
    login(&session).await;
    let mut outbound = session.outbound_documents();
    feed(
        &session,
        "<iq xmlns='jabber:client' type='get' id='R1' from='bob@example.org'>
            <query xmlns='urn:example:unknown'/>
        </iq>",
    );
    let reply = outbound.recv().await.unwrap();
    assert_eq!(reply.name(), "iq");
    assert_eq!(reply.attr("type"), Some("error"));
    assert_eq!(reply.attr("id"), Some("R1"));
    assert_eq!(reply.attr("to"), Some("bob@example.org"));
    let error = reply.get_child("error", ns::JABBER_CLIENT).unwrap();
    assert!(error
        .get_child("feature-not-implemented", ns::XMPP_STANZAS)
        .is_some());
}

struct PingPlugin {
    #[allow(dead_code)]
    handle: SessionHandle,
}

impl Plugin for PingPlugin {
    fn features(&self) -> Vec<String> {
        vec!["urn:xmpp:ping".to_owned()]
    }

    fn supported_iqs(&self) -> Vec<IqSignature> {
        vec![IqSignature::new("urn:xmpp:ping", "ping")]
    }
}

impl PluginInit for PingPlugin {
    fn init(session: &Session) -> Self {
        PingPlugin {
            handle: session.handle(),
        }
    }
}

struct DiscoPlugin {
    #[allow(dead_code)]
    handle: SessionHandle,
}

impl Plugin for DiscoPlugin {
    fn features(&self) -> Vec<String> {
        vec![ns::DISCO_INFO.to_owned()]
    }

    fn supported_iqs(&self) -> Vec<IqSignature> {
        vec![IqSignature::new(ns::DISCO_INFO, "query")]
    }
}

impl PluginInit for DiscoPlugin {
    fn init(session: &Session) -> Self {
        DiscoPlugin {
            handle: session.handle(),
        }
    }

    fn register_dependencies(session: &Session) {
        let _ = session.apply::<PingPlugin>();
    }
}

#[tokio::test]
async fn apply_is_idempotent_and_recursive() {
    let session = new_session();
    let disco = session.apply::<DiscoPlugin>().unwrap();
    // The dependency was applied first.
    assert!(session.get::<PingPlugin>().is_some());
    let again = session.apply::<DiscoPlugin>().unwrap();
    assert!(Arc::ptr_eq(&disco, &again));
    let mut features = session.client_features();
    features.sort();
    assert_eq!(features, [ns::DISCO_INFO.to_owned(), "urn:xmpp:ping".to_owned()]);
}

#[tokio::test]
async fn supported_iqs_reach_subscribers_unanswered() {
    let session = new_session();
    session.apply::<PingPlugin>().unwrap();
    login(&session).await;
    let mut stanzas = session.stanzas();
    let mut outbound = session.outbound_documents();
    feed(
        &session,
        "<iq xmlns='jabber:client' type='get' id='P1' from='bob@example.org'>
            <ping xmlns='urn:xmpp:ping'/>
        </iq>",
    );
    let stanza = stanzas.recv().await.unwrap();
    assert_eq!(stanza.id(), Some("P1"));
    // No automatic error reply for a supported iq.
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn misnamespaced_stanza_terminates_the_stream() {
    let session = new_session();
    login(&session).await;
    let mut state_rx = session.state_stream();
    let mut events = session.events();
    feed(&session, "<iq xmlns='urn:example:nope' type='get' id='x'/>");
    state_rx
        .wait_for(|state| *state == SessionState::Disconnected)
        .await
        .unwrap();
    let mut terminated = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::ConnectionTerminated) {
            terminated = true;
        }
    }
    assert!(terminated);
}

#[tokio::test]
async fn dispose_is_terminal() {
    let session = new_session();
    login(&session).await;
    let mut events = session.events();
    session.dispose().await;
    assert_eq!(session.state(), SessionState::Disposed);

    // The event bus completes after the final state change.
    let mut closed = false;
    loop {
        match events.recv().await {
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                closed = true;
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
    assert!(closed);

    // Every mutating operation is rejected now.
    let message: Element = "<message xmlns='jabber:client'/>".parse().unwrap();
    assert!(matches!(session.send(message), Err(Error::State(_))));
    assert!(session.apply::<PingPlugin>().is_err());
    let relogin = session
        .login_with(Arc::new(StaticPassword::new("secret")), plain_options())
        .await;
    assert!(matches!(relogin, Err(Error::State(_))));
    // Dispose is idempotent.
    session.dispose().await;
}
