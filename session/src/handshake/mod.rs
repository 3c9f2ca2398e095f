// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The stream negotiation engine.
//!
//! The handshaker is a pipeline stage that pilots a fresh XMPP stream
//! from the first `<open/>` through StartTLS, SASL and resource binding
//! to the completed, logged-in state, or to an orderly close. It consumes
//! the stream-control documents it understands and forwards everything
//! else down the chain.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use minidom::Element;
use tokio::sync::{mpsc, watch};

use jid::Jid;

use crate::error::{AuthError, Error, ProtocolError};
use crate::ns;
use crate::pipeline::{Pipeline, Stage, StageContext};
use crate::stanza::{make_id, Stanza};
use crate::stream::error::{DefinedCondition, StreamError};
use crate::stream::{self, Features, StreamFeature, StreamHeader};

mod bind;
mod sasl;

pub use self::sasl::{
    CredentialRetriever, StaticPassword, CREDENTIAL_PASSWORD, DEFAULT_MECHANISMS,
};

/// The pipeline slot the handshaker occupies.
pub const HANDSHAKER_SLOT: &str = "handshaker";

/// Lifecycle of a [`Handshaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// Created, waiting for the pipeline to run.
    Initialized,
    /// Stream-open sent, waiting for the server's.
    Started,
    /// Feature negotiation in progress.
    Negotiating,
    /// Every mandatory feature negotiated; the stream is usable.
    Completed,
    /// Stream-close sent, waiting for the peer's.
    StreamClosing,
    /// Both sides closed the stream.
    StreamClosed,
    /// Removed from the pipeline.
    Disposed,
}

impl HandshakeState {
    /// A short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Initialized => "Initialized",
            HandshakeState::Started => "Started",
            HandshakeState::Negotiating => "Negotiating",
            HandshakeState::Completed => "Completed",
            HandshakeState::StreamClosing => "StreamClosing",
            HandshakeState::StreamClosed => "StreamClosed",
            HandshakeState::Disposed => "Disposed",
        }
    }

    fn is_running(self) -> bool {
        matches!(
            self,
            HandshakeState::Started | HandshakeState::Negotiating | HandshakeState::Completed
        )
    }
}

/// Notifications the handshaker sends to its owning session.
#[derive(Debug)]
pub enum HandshakeEvent {
    /// The server agreed to StartTLS; the transport must upgrade now and
    /// then call [`Handshaker::tls_established`].
    StartTlsProceed,
    /// Negotiation finished; the stream is bound to the given JID.
    Completed(Jid),
    /// Negotiation failed; the error slots hold the cause.
    Failed,
    /// The stream reached the closed state.
    Closed,
}

/// Static configuration for one login attempt.
pub struct HandshakeConfig {
    /// The identity to authenticate as.
    pub authentication_id: Jid,
    /// The identity to authorize as, when different. Reserved; the
    /// mechanism layer does not consume it yet.
    pub authorization_id: Option<Jid>,
    /// Preset resource for binding; empty lets the server pick.
    pub resource: String,
    /// In-band registration requested. Reserved extension point; no wire
    /// exchange is attempted.
    pub registering: bool,
    /// SASL mechanism preference, strongest first.
    pub mechanisms: Vec<String>,
}

impl HandshakeConfig {
    /// Configuration with the default mechanism preference.
    pub fn new(authentication_id: Jid) -> HandshakeConfig {
        HandshakeConfig {
            authentication_id,
            authorization_id: None,
            resource: String::new(),
            registering: false,
            mechanisms: DEFAULT_MECHANISMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct Inner {
    state: HandshakeState,
    negotiated: HashSet<StreamFeature>,
    /// Features that block completion: the always-required pair plus any
    /// mandatory feature the server has offered.
    required: HashSet<StreamFeature>,
    header: Option<StreamHeader>,
    sasl: Option<sasl::SaslNegotiation>,
    awaiting_tls: bool,
    pending_bind_id: Option<String>,
    negotiated_jid: Option<Jid>,
    server_error: Option<StreamError>,
    client_error: Option<StreamError>,
    handshake_error: Option<Error>,
}

/// The stream negotiation stage. See the module documentation.
pub struct Handshaker {
    pipeline: Pipeline,
    config: HandshakeConfig,
    retriever: Arc<dyn CredentialRetriever>,
    events: mpsc::UnboundedSender<HandshakeEvent>,
    state_tx: watch::Sender<HandshakeState>,
    inner: Mutex<Inner>,
}

impl Handshaker {
    /// Create a handshaker for one login attempt.
    ///
    /// The returned receiver carries the [`HandshakeEvent`]s the session
    /// must react to.
    pub fn new(
        pipeline: Pipeline,
        config: HandshakeConfig,
        retriever: Arc<dyn CredentialRetriever>,
    ) -> (Arc<Handshaker>, mpsc::UnboundedReceiver<HandshakeEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(HandshakeState::Initialized);
        let mut required = HashSet::new();
        required.insert(StreamFeature::Sasl);
        required.insert(StreamFeature::ResourceBinding);
        let handshaker = Arc::new(Handshaker {
            pipeline,
            config,
            retriever,
            events,
            state_tx,
            inner: Mutex::new(Inner {
                state: HandshakeState::Initialized,
                negotiated: HashSet::new(),
                required,
                header: None,
                sasl: None,
                awaiting_tls: false,
                pending_bind_id: None,
                negotiated_jid: None,
                server_error: None,
                client_error: None,
                handshake_error: None,
            }),
        });
        (handshaker, events_rx)
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.inner.lock().unwrap().state
    }

    /// Observe handshake state changes.
    pub fn state_stream(&self) -> watch::Receiver<HandshakeState> {
        self.state_tx.subscribe()
    }

    /// The server-assigned stream id from the most recent stream header.
    pub fn stream_id(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.header.as_ref().and_then(|header| header.id.clone())
    }

    /// The JID assigned by resource binding, once negotiated.
    pub fn negotiated_jid(&self) -> Option<Jid> {
        self.inner.lock().unwrap().negotiated_jid.clone()
    }

    /// The features negotiated so far.
    pub fn negotiated_features(&self) -> HashSet<StreamFeature> {
        self.inner.lock().unwrap().negotiated.clone()
    }

    /// The stream error received from the peer, if any.
    pub fn server_stream_error(&self) -> Option<StreamError> {
        self.inner.lock().unwrap().server_error.clone()
    }

    /// The stream error this side sent, if any.
    pub fn client_stream_error(&self) -> Option<StreamError> {
        self.inner.lock().unwrap().client_error.clone()
    }

    /// Take the final outcome error, most specific slot first. Each slot
    /// is consumed by this read.
    pub fn take_error(&self) -> Option<Error> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .handshake_error
            .take()
            .or_else(|| inner.server_error.take().map(Error::Stream))
            .or_else(|| inner.client_error.take().map(Error::Stream))
    }

    /// Serialize a stream error onto the stream and initiate close.
    pub fn send_stream_error(&self, error: StreamError) {
        let mut inner = self.inner.lock().unwrap();
        self.stream_error_locked(&mut inner, error);
    }

    /// Record a failure that happened outside the stream (e.g. the
    /// transport's TLS upgrade) and close the stream.
    pub fn abort(&self, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        self.fail_locked(&mut inner, error);
    }

    /// The transport finished its TLS handshake; restart the stream.
    pub fn tls_established(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.awaiting_tls {
            log::warn!("tls_established without a pending STARTTLS exchange");
            return;
        }
        inner.awaiting_tls = false;
        inner.negotiated.insert(StreamFeature::StartTls);
        self.restart_locked(&mut inner);
    }

    /// Send the stream-close frame without waiting for the peer.
    pub fn close_stream_soft(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            HandshakeState::Initialized => {
                self.set_state(&mut inner, HandshakeState::StreamClosed);
                self.emit(HandshakeEvent::Closed);
            }
            state if state.is_running() => {
                self.send(stream::close_element());
                self.set_state(&mut inner, HandshakeState::StreamClosing);
            }
            _ => (),
        }
    }

    /// Close the stream and wait for the peer's close.
    ///
    /// Idempotent: concurrent and repeated calls all complete when the
    /// stream reaches the closed state.
    pub async fn close_stream(&self) {
        let mut rx = self.state_tx.subscribe();
        self.close_stream_soft();
        let _ = rx
            .wait_for(|state| {
                matches!(
                    state,
                    HandshakeState::StreamClosed | HandshakeState::Disposed
                )
            })
            .await;
    }

    fn emit(&self, event: HandshakeEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, element: Element) {
        if let Err(error) = self.pipeline.write(element) {
            log::debug!("handshaker could not write: {}", error);
        }
    }

    fn set_state(&self, inner: &mut Inner, to: HandshakeState) {
        if inner.state == to {
            return;
        }
        log::debug!("handshake {} -> {}", inner.state.name(), to.name());
        inner.state = to;
        self.state_tx.send_replace(to);
    }

    fn restart_locked(&self, inner: &mut Inner) {
        inner.header = None;
        self.send(stream::open_element(self.config.authentication_id.domain()));
        self.set_state(inner, HandshakeState::Started);
    }

    fn stream_error_locked(&self, inner: &mut Inner, error: StreamError) {
        if !inner.state.is_running() {
            return;
        }
        if inner.client_error.is_none() {
            inner.client_error = Some(error.clone());
        }
        self.send(error.to_element());
        self.send(stream::close_element());
        self.set_state(inner, HandshakeState::StreamClosing);
        self.emit(HandshakeEvent::Failed);
    }

    fn fail_locked(&self, inner: &mut Inner, error: Error) {
        if inner.handshake_error.is_none() {
            inner.handshake_error = Some(error);
        }
        if inner.state.is_running() {
            self.send(stream::close_element());
            self.set_state(inner, HandshakeState::StreamClosing);
        }
        self.emit(HandshakeEvent::Failed);
    }

    fn handle_open(&self, inner: &mut Inner, item: &Element) {
        if inner.state != HandshakeState::Started {
            log::warn!("stream header in state {}", inner.state.name());
            return;
        }
        let header = match StreamHeader::from_element(item) {
            Ok(header) => header,
            Err(error) => {
                self.fail_locked(&mut *inner, error.into());
                return;
            }
        };
        if let Some(from) = &header.from {
            if from.domain() != self.config.authentication_id.domain() {
                self.stream_error_locked(
                    inner,
                    StreamError::new(DefinedCondition::InvalidFrom)
                        .with_text("stream header from unexpected domain"),
                );
                return;
            }
        }
        log::debug!(
            "stream open from {:?}, id {:?}",
            header.from,
            header.id
        );
        inner.header = Some(header);
        self.set_state(inner, HandshakeState::Negotiating);
    }

    fn handle_features(&self, inner: &mut Inner, item: &Element) {
        if inner.state != HandshakeState::Negotiating {
            log::warn!("features in state {}", inner.state.name());
            return;
        }
        let features = match Features::from_element(item) {
            Ok(features) => features,
            Err(error) => {
                self.fail_locked(inner, error.into());
                return;
            }
        };
        if let Some(unknown) = features.required_unknown() {
            log::warn!(
                "server requires unknown feature {{{}}}{}",
                unknown.ns(),
                unknown.name()
            );
            self.stream_error_locked(
                inner,
                StreamError::new(DefinedCondition::UnsupportedFeature),
            );
            return;
        }
        for feature in StreamFeature::RECOMMENDED_ORDER {
            if feature.mandatory() && features.offers(feature) {
                inner.required.insert(feature);
            }
        }
        for feature in StreamFeature::RECOMMENDED_ORDER {
            if inner.negotiated.contains(&feature) || !features.offers(feature) {
                continue;
            }
            match feature {
                StreamFeature::StartTls => {
                    inner.awaiting_tls = true;
                    self.send(Element::builder("starttls", ns::TLS).build());
                    return;
                }
                StreamFeature::Sasl => {
                    self.start_sasl(inner, &features.mechanisms);
                    return;
                }
                // Understood but never selected; no compressor is wired
                // in.
                StreamFeature::StreamCompression => continue,
                StreamFeature::ResourceBinding => {
                    let id = make_id();
                    self.send(bind::bind_request(&id, &self.config.resource));
                    inner.pending_bind_id = Some(id);
                    return;
                }
            }
        }
        // Nothing selectable in this features round.
        if inner.required.is_subset(&inner.negotiated) {
            self.complete(inner);
        } else {
            log::warn!("no selectable feature but mandatory negotiation incomplete");
            self.fail_locked(inner, ProtocolError::MissingFeatures.into());
        }
    }

    fn start_sasl(&self, inner: &mut Inner, offered: &[String]) {
        match sasl::select_mechanism(
            offered,
            &self.config.mechanisms,
            &self.config.authentication_id,
            self.retriever.as_ref(),
        ) {
            Ok(Some((negotiation, initial))) => {
                let auth = Element::builder("auth", ns::SASL)
                    .attr("mechanism", negotiation.name())
                    .append(encode_payload(&initial))
                    .build();
                inner.sasl = Some(negotiation);
                self.send(auth);
            }
            Ok(None) => {
                log::warn!("no SASL mechanism in common with the server");
                if inner.handshake_error.is_none() {
                    inner.handshake_error = Some(AuthError::NoMechanism.into());
                }
                self.send(Element::builder("abort", ns::SASL).build());
                self.stream_error_locked(
                    inner,
                    StreamError::new(DefinedCondition::PolicyViolation)
                        .with_text("no mutually supported SASL mechanism"),
                );
            }
            Err(error) => self.fail_locked(inner, error),
        }
    }

    fn handle_sasl(&self, inner: &mut Inner, item: &Element) {
        match item.name() {
            "challenge" if inner.sasl.is_some() => {
                let data = match decode_payload(&item.text()) {
                    Some(data) => data,
                    None => {
                        self.stream_error_locked(
                            inner,
                            StreamError::new(DefinedCondition::NotAuthorized)
                                .with_text("undecodable SASL challenge"),
                        );
                        return;
                    }
                };
                let response = inner
                    .sasl
                    .as_mut()
                    .expect("checked above")
                    .respond(&data);
                match response {
                    Ok(response) => {
                        self.send(
                            Element::builder("response", ns::SASL)
                                .append(encode_payload(&response))
                                .build(),
                        );
                    }
                    Err(error) => {
                        inner.handshake_error = Some(error.into());
                        self.stream_error_locked(
                            inner,
                            StreamError::new(DefinedCondition::NotAuthorized),
                        );
                    }
                }
            }
            "success" if inner.sasl.is_some() => {
                let text = item.text();
                let data = match decode_payload(&text) {
                    Some(data) => data,
                    None => {
                        self.stream_error_locked(
                            inner,
                            StreamError::new(DefinedCondition::NotAuthorized)
                                .with_text("undecodable SASL success data"),
                        );
                        return;
                    }
                };
                let mut negotiation = inner.sasl.take().expect("checked above");
                match negotiation.accept(&data) {
                    Ok(()) => {
                        log::debug!("SASL {} negotiated", negotiation.name());
                        inner.negotiated.insert(StreamFeature::Sasl);
                        self.restart_locked(inner);
                    }
                    Err(error) => {
                        inner.handshake_error = Some(error.into());
                        let condition = if data.is_empty() {
                            // Success without data although the mechanism
                            // still expected verification material.
                            DefinedCondition::PolicyViolation
                        } else {
                            DefinedCondition::NotAuthorized
                        };
                        self.stream_error_locked(inner, StreamError::new(condition));
                    }
                }
            }
            "failure" => {
                let condition = item
                    .children()
                    .find(|child| child.ns() == ns::SASL && child.name() != "text")
                    .map(|child| child.name().to_owned())
                    .unwrap_or_else(|| "undefined-condition".to_owned());
                let text = item
                    .get_child("text", ns::SASL)
                    .map(|child| child.text());
                log::warn!("authentication failed: {}", condition);
                inner.sasl = None;
                self.fail_locked(inner, AuthError::Fail { condition, text }.into());
            }
            other => {
                log::warn!("unexpected SASL element <{}/>", other);
                self.stream_error_locked(
                    inner,
                    StreamError::new(DefinedCondition::UnsupportedStanzaType),
                );
            }
        }
    }

    fn handle_tls(&self, inner: &mut Inner, item: &Element) {
        match item.name() {
            "proceed" if inner.awaiting_tls => {
                log::debug!("server agreed to STARTTLS");
                self.emit(HandshakeEvent::StartTlsProceed);
            }
            "failure" => {
                self.fail_locked(inner, ProtocolError::StartTlsRefused.into());
            }
            other => {
                log::warn!("unexpected TLS element <{}/>", other);
                self.stream_error_locked(
                    inner,
                    StreamError::new(DefinedCondition::UnsupportedStanzaType),
                );
            }
        }
    }

    fn handle_bind(&self, inner: &mut Inner, item: &Element) {
        inner.pending_bind_id = None;
        match item.attr("type") {
            Some("result") => match bind::jid_from_response(item) {
                Ok(jid) => {
                    if jid.is_full()
                        && jid.to_bare() != self.config.authentication_id.to_bare()
                    {
                        self.stream_error_locked(
                            inner,
                            StreamError::new(DefinedCondition::InvalidXml)
                                .with_text("bind result names a foreign JID"),
                        );
                        return;
                    }
                    log::debug!("bound as {}", jid);
                    inner.negotiated_jid = Some(jid);
                    inner.negotiated.insert(StreamFeature::ResourceBinding);
                    if inner.required.is_subset(&inner.negotiated) {
                        self.complete(inner);
                    } else {
                        self.fail_locked(inner, ProtocolError::MissingFeatures.into());
                    }
                }
                Err(error) => {
                    inner.handshake_error = Some(error.into());
                    self.stream_error_locked(
                        inner,
                        StreamError::new(DefinedCondition::InvalidXml),
                    );
                }
            },
            Some("error") => {
                let stanza_error = Stanza::from_element(item.clone())
                    .ok()
                    .and_then(|stanza| stanza.error())
                    .unwrap_or_else(|| {
                        crate::stanza::error::StanzaError::new(
                            crate::stanza::error::ErrorType::Cancel,
                            crate::stanza::error::DefinedCondition::UndefinedCondition,
                            None,
                        )
                    });
                log::warn!("resource binding rejected: {}", stanza_error);
                self.fail_locked(inner, Error::Stanza(stanza_error));
            }
            _ => log::warn!("bind response with unexpected iq type"),
        }
    }

    fn handle_server_error(&self, inner: &mut Inner, item: &Element) {
        let error = StreamError::from_element(item).unwrap_or_else(|| {
            StreamError::new(DefinedCondition::UndefinedCondition)
        });
        log::warn!("stream error from server: {}", error);
        inner.server_error = Some(error);
        inner.sasl = None;
        self.send(stream::close_element());
        self.set_state(inner, HandshakeState::StreamClosed);
        self.emit(HandshakeEvent::Failed);
    }

    fn handle_peer_close(&self, inner: &mut Inner) {
        match inner.state {
            HandshakeState::StreamClosing => {
                self.set_state(inner, HandshakeState::StreamClosed);
                self.emit(HandshakeEvent::Closed);
            }
            HandshakeState::StreamClosed | HandshakeState::Disposed => (),
            _ => {
                self.send(stream::close_element());
                self.set_state(inner, HandshakeState::StreamClosed);
                self.emit(HandshakeEvent::Closed);
            }
        }
    }

    fn complete(&self, inner: &mut Inner) {
        let jid = inner
            .negotiated_jid
            .clone()
            .unwrap_or_else(|| self.config.authentication_id.clone());
        self.set_state(inner, HandshakeState::Completed);
        log::info!("handshake completed as {}", jid);
        self.emit(HandshakeEvent::Completed(jid));
    }
}

impl Stage for Handshaker {
    fn on_activate(&self, _ctx: &StageContext) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == HandshakeState::Initialized {
            self.restart_locked(&mut inner);
        }
    }

    fn on_read(&self, _ctx: &StageContext, item: Element) -> Result<Vec<Element>, Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == HandshakeState::Disposed {
            return Ok(vec![item]);
        }
        if stream::is_open(&item) {
            self.handle_open(&mut inner, &item);
            return Ok(Vec::new());
        }
        if stream::is_close(&item) {
            self.handle_peer_close(&mut inner);
            return Ok(Vec::new());
        }
        if StreamError::is_stream_error(&item) {
            self.handle_server_error(&mut inner, &item);
            return Ok(Vec::new());
        }
        if Features::is_features(&item) {
            self.handle_features(&mut inner, &item);
            return Ok(Vec::new());
        }
        if item.ns() == ns::SASL {
            self.handle_sasl(&mut inner, &item);
            return Ok(Vec::new());
        }
        if item.ns() == ns::TLS {
            self.handle_tls(&mut inner, &item);
            return Ok(Vec::new());
        }
        if item.name() == "iq" {
            let claimed = match (&inner.pending_bind_id, item.attr("id")) {
                (Some(pending), Some(id)) => pending == id,
                _ => false,
            };
            if claimed {
                self.handle_bind(&mut inner, &item);
                return Ok(Vec::new());
            }
        }
        Ok(vec![item])
    }

    fn on_removed(&self, _ctx: &StageContext) {
        let mut inner = self.inner.lock().unwrap();
        inner.sasl = None;
        self.set_state(&mut inner, HandshakeState::Disposed);
        self.emit(HandshakeEvent::Closed);
    }
}

fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_owned()
    } else {
        BASE64.encode(data)
    }
}

fn decode_payload(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Some(Vec::new());
    }
    BASE64.decode(text.as_bytes()).ok()
}
