// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The public entry point: session lifecycle, stanza exchange, iq
//! correlation, events and plugins.

use std::sync::{Arc, Mutex, Weak};

use minidom::Element;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;

use jid::Jid;

use crate::error::{Error, StateError};
use crate::handshake::{
    CredentialRetriever, HandshakeConfig, HandshakeEvent, Handshaker, StaticPassword,
    HANDSHAKER_SLOT,
};
use crate::pipeline::{PassThrough, Pipeline, XmlValidator};
use crate::stanza::{self, make_id, IqType, Stanza, StanzaKind};
use crate::stanza::error::{DefinedCondition, ErrorType, StanzaError};
use crate::stream::error::StreamError;
use crate::transport::Transport;

mod event;
mod iq;
mod plugin;
#[cfg(test)]
mod tests;

pub use self::event::Event;
pub use self::iq::{IqOutcome, IqResponseToken};
pub use self::plugin::{IqSignature, Plugin, PluginInit};

use self::iq::IqResponseTracker;
use self::plugin::PluginManager;

/// Capacity of the session's broadcast channels.
const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a [`Session`].
///
/// The ordering matches the forward path of a connection's life; it is
/// what makes range checks like "at least connected" meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// No connection. The only state `login` may start from.
    Disconnected,
    /// The transport is being opened.
    Connecting,
    /// The transport is open, the handshake has not started.
    Connected,
    /// Stream negotiation in progress.
    Handshaking,
    /// Logged in; stanzas flow.
    Online,
    /// An orderly teardown is in progress.
    Disconnecting,
    /// Terminal. Every mutating operation is rejected.
    Disposed,
}

impl SessionState {
    /// A short name for logs and state errors.
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Handshaking => "Handshaking",
            SessionState::Online => "Online",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Disposed => "Disposed",
        }
    }
}

const CONNECTED_STATES: [SessionState; 4] = [
    SessionState::Connecting,
    SessionState::Connected,
    SessionState::Handshaking,
    SessionState::Online,
];

/// Options for [`Session::login_with`].
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// Resource to request at bind time; defaults to the account JID's
    /// resource, if any.
    pub resource: Option<String>,
    /// Request in-band registration. Reserved; no wire exchange is
    /// attempted.
    pub registering: bool,
    /// SASL mechanism preference override, strongest first.
    pub mechanisms: Option<Vec<String>>,
    /// Connection-level compression algorithm. Reserved.
    pub connection_compression: Option<String>,
    /// Stream-level compression algorithm. Reserved; the stream
    /// compression feature is never selected.
    pub stream_compression: Option<String>,
    /// TLS-level compression algorithm. Reserved.
    pub tls_compression: Option<String>,
}

/// Receipt for a sent document.
#[derive(Debug)]
pub struct SendReceipt {
    /// Completes when the server acknowledges the stanza. Populated only
    /// when stream management is in use, which is not implemented yet,
    /// so currently always `None`.
    pub acknowledgment: Option<oneshot::Receiver<()>>,
}

/// Receipt for an iq query sent with [`Session::send_iq_query`].
pub struct IqQueryReceipt {
    /// Resolves to the response; see [`IqOutcome`].
    pub response: IqResponseToken,
}

struct SessionInner {
    jid: Jid,
    transport: Arc<dyn Transport>,
    pipeline: Pipeline,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    events_tx: Mutex<Option<broadcast::Sender<Event>>>,
    stanzas_tx: Mutex<Option<broadcast::Sender<Stanza>>>,
    iq: IqResponseTracker,
    plugins: PluginManager,
    bound: Mutex<Option<Jid>>,
    handshaker: Mutex<Option<Arc<Handshaker>>>,
}

impl SessionInner {
    fn emit(&self, event: Event) {
        if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn broadcast_stanza(&self, stanza: Stanza) {
        if let Some(tx) = self.stanzas_tx.lock().unwrap().as_ref() {
            let _ = tx.send(stanza);
        }
    }
}

/// A client-side XMPP session.
///
/// The session owns one processing [`Pipeline`] for its whole life; the
/// pipeline's `"handshaker"` slot holds a pass-through stage between
/// logins and a fresh [`Handshaker`] during one.
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// A non-owning reference to a [`Session`], for plugins and other
/// back-references.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Weak<SessionInner>,
}

impl SessionHandle {
    /// The session, unless it has been dropped.
    pub fn session(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    /// Create a session for `jid` over the given transport.
    ///
    /// Must be called within a tokio runtime: the session spawns its
    /// inbound dispatch workers here.
    pub fn new(jid: Jid, transport: Arc<dyn Transport>) -> Session {
        let pipeline = Pipeline::new();
        pipeline
            .add_last("xml-validator", Arc::new(XmlValidator))
            .expect("fresh pipeline accepts stages");
        pipeline
            .add_last(HANDSHAKER_SLOT, Arc::new(PassThrough))
            .expect("fresh pipeline accepts stages");
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let inner = Arc::new(SessionInner {
            jid,
            transport,
            pipeline,
            state: Mutex::new(SessionState::Disconnected),
            state_tx,
            events_tx: Mutex::new(Some(broadcast::channel(CHANNEL_CAPACITY).0)),
            stanzas_tx: Mutex::new(Some(broadcast::channel(CHANNEL_CAPACITY).0)),
            iq: IqResponseTracker::new(),
            plugins: PluginManager::new(),
            bound: Mutex::new(None),
            handshaker: Mutex::new(None),
        });
        spawn_inbound_dispatch(&inner);
        spawn_error_watch(&inner, true);
        spawn_error_watch(&inner, false);
        Session { inner }
    }

    /// The account JID this session was created for.
    pub fn jid(&self) -> &Jid {
        &self.inner.jid
    }

    /// The JID assigned by resource binding, once online.
    pub fn bound_jid(&self) -> Option<Jid> {
        self.inner.bound.lock().unwrap().clone()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    /// Observe lifecycle state changes.
    pub fn state_stream(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to the event bus.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        subscribe_or_closed(&self.inner.events_tx)
    }

    /// Subscribe to inbound stanzas.
    pub fn stanzas(&self) -> broadcast::Receiver<Stanza> {
        subscribe_or_closed(&self.inner.stanzas_tx)
    }

    /// The inbound stanzas as a `futures::Stream`.
    ///
    /// Items arrive in the order received from the transport; a lag
    /// error is yielded when a slow consumer missed stanzas.
    pub fn stanza_stream(&self) -> BroadcastStream<Stanza> {
        BroadcastStream::new(self.stanzas())
    }

    /// A weak handle for plugins and other back-references.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Feed one inbound document from the transport into the pipeline.
    pub fn feed(&self, document: Element) -> Result<(), Error> {
        self.inner.pipeline.read(document)
    }

    /// Documents the transport must serialize onto the wire.
    pub fn outbound_documents(&self) -> broadcast::Receiver<Element> {
        self.inner.pipeline.outbound_stream()
    }

    /// The transport lost the connection.
    pub async fn connection_terminated(&self) {
        self.connection_lost(None).await;
    }

    /// Log in with a password, using the default mechanism preference.
    pub async fn login(&self, password: &str) -> Result<Jid, Error> {
        self.login_with(
            Arc::new(StaticPassword::new(password)),
            LoginOptions::default(),
        )
        .await
    }

    /// Log in with a credential retriever and explicit options.
    ///
    /// Opens the transport, installs a fresh handshaker into the
    /// pipeline's `"handshaker"` slot and drives it to completion. On
    /// success the session is `Online` and the bound JID is returned; on
    /// failure the session is back at `Disconnected` and the handshake's
    /// outcome error is returned. Cancel by calling
    /// [`disconnect`][`Session::disconnect`].
    pub async fn login_with(
        &self,
        retriever: Arc<dyn CredentialRetriever>,
        options: LoginOptions,
    ) -> Result<Jid, Error> {
        self.transition_from(
            &[SessionState::Disconnected],
            SessionState::Connecting,
            "login",
        )?;
        if let Err(error) = self.inner.transport.open().await {
            self.transition(SessionState::Disconnected);
            return Err(error);
        }
        self.transition(SessionState::Connected);

        let mut config = HandshakeConfig::new(self.inner.jid.clone());
        config.resource = options
            .resource
            .clone()
            .or_else(|| self.inner.jid.resource().map(str::to_owned))
            .unwrap_or_default();
        config.registering = options.registering;
        if let Some(mechanisms) = &options.mechanisms {
            config.mechanisms = mechanisms.clone();
        }

        let (handshaker, events) =
            Handshaker::new(self.inner.pipeline.clone(), config, retriever);
        *self.inner.handshaker.lock().unwrap() = Some(handshaker.clone());
        if let Err(error) = self.inner.pipeline.replace(HANDSHAKER_SLOT, handshaker.clone()) {
            return Err(self.fail_login(error).await);
        }

        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(drive_handshake(
            Arc::downgrade(&self.inner),
            handshaker,
            events,
            result_tx,
        ));

        if let Err(error) = self.inner.pipeline.start() {
            return Err(self.fail_login(error).await);
        }
        self.transition(SessionState::Handshaking);

        match result_rx.await {
            Ok(Ok(jid)) => Ok(jid),
            Ok(Err(error)) => Err(self.fail_login(error).await),
            Err(_) => Err(self.fail_login(Error::Disconnected).await),
        }
    }

    /// Tear the connection down.
    ///
    /// Idempotent: completes immediately when already disconnected or
    /// disposed, and waits for an in-flight disconnect to finish.
    pub async fn disconnect(&self) -> Result<(), Error> {
        loop {
            match self.state() {
                SessionState::Disconnected | SessionState::Disposed => return Ok(()),
                SessionState::Disconnecting => {
                    let mut rx = self.inner.state_tx.subscribe();
                    let _ = rx
                        .wait_for(|state| {
                            matches!(
                                state,
                                SessionState::Disconnected | SessionState::Disposed
                            )
                        })
                        .await;
                    return Ok(());
                }
                _ => {
                    if self
                        .transition_from(
                            &CONNECTED_STATES,
                            SessionState::Disconnecting,
                            "disconnect",
                        )
                        .is_err()
                    {
                        // Lost the race against another transition.
                        continue;
                    }
                    self.shutdown_connection(true).await;
                    return Ok(());
                }
            }
        }
    }

    /// Dispose the session: disconnect if necessary, then release every
    /// resource and complete all streams. Terminal and idempotent.
    pub async fn dispose(&self) {
        match self.state() {
            SessionState::Disposed => return,
            SessionState::Disconnected => (),
            _ => {
                let _ = self.disconnect().await;
            }
        }
        self.transition(SessionState::Disposed);
        self.inner.pipeline.dispose();
        self.inner.iq.complete_all_empty();
        self.inner.events_tx.lock().unwrap().take();
        self.inner.stanzas_tx.lock().unwrap().take();
    }

    /// Send a document.
    ///
    /// Stanzas get an id assigned if they lack one. Allowed while
    /// `Online` (and in the earlier connected states, for
    /// framework-internal traffic).
    pub fn send(&self, mut document: Element) -> Result<SendReceipt, Error> {
        self.check_sendable("send")?;
        stanza::ensure_id(&mut document);
        self.inner.pipeline.write(document)?;
        Ok(SendReceipt {
            acknowledgment: None,
        })
    }

    /// Send a stream error and close the stream.
    ///
    /// Stream errors are terminal for the current stream; the session
    /// will end up `Disconnected`.
    pub fn send_stream_error(&self, error: StreamError) -> Result<(), Error> {
        self.check_sendable("send_stream_error")?;
        let handshaker = self.inner.handshaker.lock().unwrap().clone();
        match handshaker {
            Some(handshaker) => {
                handshaker.send_stream_error(error);
                Ok(())
            }
            None => Err(Error::Disconnected),
        }
    }

    /// Send an iq `get` carrying `<query xmlns=namespace …attrs/>` and
    /// return a receipt that resolves on the matching response.
    pub fn send_iq_query(
        &self,
        namespace: &str,
        to: Option<&Jid>,
        params: Option<&[(&str, &str)]>,
    ) -> Result<IqQueryReceipt, Error> {
        self.check_sendable("send_iq_query")?;
        let id = make_id();
        let mut query = Element::builder("query", namespace);
        for (name, value) in params.unwrap_or(&[]) {
            query = query.attr(*name, *value);
        }
        let iq = Stanza::iq_template(IqType::Get, &id, to).with_payload(query.build());
        let response = self.inner.iq.allocate(id.clone());
        match self.inner.pipeline.write(iq.into_element()) {
            Ok(()) => Ok(IqQueryReceipt { response }),
            Err(error) => {
                self.inner.iq.forget(&id);
                Err(error)
            }
        }
    }

    /// Apply a plugin, registering its dependencies first. Idempotent.
    pub fn apply<P: PluginInit + 'static>(&self) -> Result<Arc<P>, Error> {
        if self.state() == SessionState::Disposed {
            return Err(StateError::new("apply", SessionState::Disposed.name()).into());
        }
        if let Some(existing) = self.inner.plugins.get::<P>() {
            return Ok(existing);
        }
        P::register_dependencies(self);
        // A dependency cycle may have registered us in the meantime;
        // insert() keeps the first instance.
        Ok(self.inner.plugins.insert(Arc::new(P::init(self))))
    }

    /// Look up a plugin by type.
    pub fn get<P: Plugin>(&self) -> Option<Arc<P>> {
        self.inner.plugins.get::<P>()
    }

    /// Union of the feature URIs advertised by the registered plugins,
    /// for service discovery responses.
    pub fn client_features(&self) -> Vec<String> {
        self.inner.plugins.features()
    }

    fn check_sendable(&self, operation: &'static str) -> Result<(), Error> {
        let state = self.state();
        match state {
            SessionState::Connected | SessionState::Handshaking | SessionState::Online => Ok(()),
            _ => Err(StateError::new(operation, state.name()).into()),
        }
    }

    /// Unconditional transition, with state-change event.
    fn transition(&self, to: SessionState) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == to {
            return;
        }
        log::debug!("session {} -> {}", state.name(), to.name());
        *state = to;
        self.inner.state_tx.send_replace(to);
        self.inner.emit(Event::StateChanged(to));
    }

    /// Compare-and-transition; fails with a state violation when the
    /// current state is not in `allowed`.
    fn transition_from(
        &self,
        allowed: &[SessionState],
        to: SessionState,
        operation: &'static str,
    ) -> Result<(), StateError> {
        let mut state = self.inner.state.lock().unwrap();
        if !allowed.contains(&*state) {
            return Err(StateError::new(operation, state.name()));
        }
        log::debug!("session {} -> {}", state.name(), to.name());
        *state = to;
        self.inner.state_tx.send_replace(to);
        self.inner.emit(Event::StateChanged(to));
        Ok(())
    }

    async fn fail_login(&self, error: Error) -> Error {
        if self
            .transition_from(&CONNECTED_STATES, SessionState::Disconnecting, "login-failure")
            .is_ok()
        {
            self.shutdown_connection(false).await;
        }
        error
    }

    /// Post-login connection loss: stream error, validation failure or
    /// transport termination.
    async fn connection_lost(&self, cause: Option<Error>) {
        if self
            .transition_from(
                &CONNECTED_STATES,
                SessionState::Disconnecting,
                "connection-lost",
            )
            .is_err()
        {
            return;
        }
        if let Some(cause) = cause {
            self.inner.emit(Event::ExceptionCaught(Arc::new(cause)));
        }
        self.shutdown_connection(false).await;
        self.inner.emit(Event::ConnectionTerminated);
    }

    /// Common teardown: detach the handshaker, close the transport, stop
    /// the pipeline and complete pending queries. Ends `Disconnected`.
    async fn shutdown_connection(&self, graceful_close: bool) {
        let handshaker = self.inner.handshaker.lock().unwrap().take();
        if let (Some(handshaker), true) = (&handshaker, graceful_close) {
            handshaker.close_stream_soft();
        }
        let _ = self
            .inner
            .pipeline
            .replace(HANDSHAKER_SLOT, Arc::new(PassThrough));
        let _ = self.inner.transport.close().await;
        let _ = self.inner.pipeline.stop_now();
        self.inner.pipeline.clear_pending();
        *self.inner.bound.lock().unwrap() = None;
        self.inner.iq.complete_all_empty();
        self.transition(SessionState::Disconnected);
    }
}

fn subscribe_or_closed<T: Clone>(
    slot: &Mutex<Option<broadcast::Sender<T>>>,
) -> broadcast::Receiver<T> {
    match slot.lock().unwrap().as_ref() {
        Some(tx) => tx.subscribe(),
        None => broadcast::channel(1).1,
    }
}

/// Session-side worker reacting to handshaker events: drives the
/// transport's TLS upgrade, resolves the login future and handles
/// post-login stream failure.
async fn drive_handshake(
    inner: Weak<SessionInner>,
    handshaker: Arc<Handshaker>,
    mut events: mpsc::UnboundedReceiver<HandshakeEvent>,
    result_tx: oneshot::Sender<Result<Jid, Error>>,
) {
    let mut result_tx = Some(result_tx);
    while let Some(event) = events.recv().await {
        let Some(strong) = inner.upgrade() else {
            break;
        };
        let session = Session { inner: strong };
        match event {
            HandshakeEvent::StartTlsProceed => {
                match session.inner.transport.start_tls().await {
                    Ok(()) => {
                        handshaker.tls_established();
                        session.inner.emit(Event::StartTlsHandshakeCompleted);
                    }
                    Err(error) => handshaker.abort(error),
                }
            }
            HandshakeEvent::Completed(jid) => {
                *session.inner.bound.lock().unwrap() = Some(jid.clone());
                session.transition(SessionState::Online);
                if let Some(tx) = result_tx.take() {
                    let _ = tx.send(Ok(jid));
                }
            }
            HandshakeEvent::Failed | HandshakeEvent::Closed => {
                let error = handshaker.take_error().unwrap_or(Error::Disconnected);
                match result_tx.take() {
                    // Still logging in: the login call does the teardown.
                    Some(tx) => {
                        let _ = tx.send(Err(error));
                    }
                    None => session.connection_lost(Some(error)).await,
                }
                break;
            }
        }
    }
}

fn spawn_inbound_dispatch(inner: &Arc<SessionInner>) {
    let mut rx = inner.pipeline.inbound_stream();
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    dispatch_inbound(&inner, item);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("inbound dispatch lagged, {} documents lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Deliver one post-pipeline inbound document: iq correlation first,
/// then plugin dispatch, then the subscriber broadcast.
fn dispatch_inbound(inner: &Arc<SessionInner>, item: Element) {
    let stanza = match Stanza::from_element(item) {
        Ok(stanza) => stanza,
        Err(_) => {
            log::debug!("ignoring non-stanza document past the handshaker");
            return;
        }
    };
    if stanza.kind() != StanzaKind::Iq {
        inner.broadcast_stanza(stanza);
        return;
    }
    match stanza.iq_type() {
        Some(IqType::Result) | Some(IqType::Error) => {
            if let Some(unclaimed) = inner.iq.handle_response(stanza) {
                log::trace!(
                    "dropping iq response with no pending query, id {:?}",
                    unclaimed.id()
                );
            }
        }
        Some(IqType::Get) | Some(IqType::Set) => match stanza.payload_signature() {
            Some((name, namespace)) if inner.plugins.supports_iq(&namespace, &name) => {
                inner.broadcast_stanza(stanza);
            }
            Some(_) => {
                answer_request(
                    inner,
                    &stanza,
                    StanzaError::new(
                        ErrorType::Cancel,
                        DefinedCondition::FeatureNotImplemented,
                        None,
                    ),
                );
            }
            None => {
                answer_request(
                    inner,
                    &stanza,
                    StanzaError::new(ErrorType::Modify, DefinedCondition::BadRequest, None),
                );
            }
        },
        None => {
            answer_request(
                inner,
                &stanza,
                StanzaError::new(ErrorType::Modify, DefinedCondition::BadRequest, None),
            );
        }
    }
}

fn answer_request(inner: &Arc<SessionInner>, request: &Stanza, error: StanzaError) {
    let reply = Stanza::iq_error(
        request.id().unwrap_or(""),
        request.from_addr().as_ref(),
        &error,
        request.payload().cloned(),
    );
    log::debug!(
        "answering unhandled iq {:?} with {}",
        request.id(),
        error
    );
    if let Err(write_error) = inner.pipeline.write(reply.into_element()) {
        log::debug!("could not answer iq: {}", write_error);
    }
}

fn spawn_error_watch(inner: &Arc<SessionInner>, inbound: bool) {
    let mut rx = if inbound {
        inner.pipeline.inbound_errors()
    } else {
        inner.pipeline.outbound_errors()
    };
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(report) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.emit(Event::ExceptionCaught(report.error.clone()));
                    if inbound {
                        if let Error::Stream(stream_error) = report.error.as_ref() {
                            // Validation failures convert to a stream
                            // error on the wire and close the stream.
                            let handshaker = inner.handshaker.lock().unwrap().clone();
                            if let Some(handshaker) = handshaker {
                                handshaker.send_stream_error(stream_error.clone());
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("error watch lagged, {} reports lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
