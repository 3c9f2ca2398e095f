// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An ordered, mutable-by-name chain of document-processing stages.
//!
//! Inbound items walk the chain head to tail through `on_read`; outbound
//! items walk tail to head through `on_write`. Survivors of each walk are
//! published on the direction's observable. Each direction serializes its
//! own processing; the two directions may progress concurrently.

use core::fmt;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex};

use minidom::Element;
use tokio::sync::{broadcast, watch};

use crate::error::Error;

mod stage;
mod validator;

pub use self::stage::{PassThrough, Stage, StageContext};
pub use self::validator::XmlValidator;

/// Capacity of the pipeline's broadcast observables.
const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, never started.
    Initialized,
    /// Items are dispatched through the chain.
    Running,
    /// Items are enqueued but not dispatched.
    Stopped,
    /// Terminal; all observables are completed.
    Disposed,
}

impl PipelineState {
    /// A short name for logs and state errors.
    pub fn name(self) -> &'static str {
        match self {
            PipelineState::Initialized => "Initialized",
            PipelineState::Running => "Running",
            PipelineState::Stopped => "Stopped",
            PipelineState::Disposed => "Disposed",
        }
    }
}

/// Structural or lifecycle errors raised by pipeline operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// No stage is registered under the given name.
    NoSuchStage(String),
    /// A stage is already registered under the given name.
    DuplicateStage(String),
    /// The pipeline has been disposed.
    Disposed,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PipelineError::NoSuchStage(name) => write!(fmt, "no stage named {:?}", name),
            PipelineError::DuplicateStage(name) => {
                write!(fmt, "a stage named {:?} already exists", name)
            }
            PipelineError::Disposed => write!(fmt, "the pipeline has been disposed"),
        }
    }
}

impl StdError for PipelineError {}

/// A stage hook failure, published on the direction's error stream.
///
/// The offending item is dropped; the pipeline itself keeps running.
#[derive(Debug, Clone)]
pub struct StageError {
    /// The name of the stage whose hook failed.
    pub stage: String,
    /// The failure itself.
    pub error: Arc<Error>,
}

#[derive(Clone)]
struct NamedStage {
    name: String,
    stage: Arc<dyn Stage>,
}

enum DirectionKind {
    Inbound,
    Outbound,
}

struct Direction {
    kind: DirectionKind,
    /// Serializes processing: while an item is being walked through the
    /// chain in this direction, no other item advances.
    process: Mutex<()>,
    /// Items received while not running.
    pending: Mutex<VecDeque<Element>>,
    stream_tx: Mutex<Option<broadcast::Sender<Element>>>,
    error_tx: Mutex<Option<broadcast::Sender<StageError>>>,
}

impl Direction {
    fn new(kind: DirectionKind) -> Direction {
        Direction {
            kind,
            process: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            stream_tx: Mutex::new(Some(broadcast::channel(CHANNEL_CAPACITY).0)),
            error_tx: Mutex::new(Some(broadcast::channel(CHANNEL_CAPACITY).0)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Element> {
        subscribe_or_closed(&self.stream_tx)
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<StageError> {
        subscribe_or_closed(&self.error_tx)
    }

    fn complete(&self) {
        self.stream_tx.lock().unwrap().take();
        self.error_tx.lock().unwrap().take();
        self.pending.lock().unwrap().clear();
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

struct Inner {
    chain: Mutex<Vec<NamedStage>>,
    state: Mutex<PipelineState>,
    state_tx: watch::Sender<PipelineState>,
    inbound: Direction,
    outbound: Direction,
}

/// The stage chain; see the module documentation.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Create an empty pipeline in the `Initialized` state.
    pub fn new() -> Pipeline {
        let (state_tx, _) = watch::channel(PipelineState::Initialized);
        Pipeline {
            inner: Arc::new(Inner {
                chain: Mutex::new(Vec::new()),
                state: Mutex::new(PipelineState::Initialized),
                state_tx,
                inbound: Direction::new(DirectionKind::Inbound),
                outbound: Direction::new(DirectionKind::Outbound),
            }),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.inner.state.lock().unwrap()
    }

    /// Observe lifecycle state changes.
    pub fn state_stream(&self) -> watch::Receiver<PipelineState> {
        self.inner.state_tx.subscribe()
    }

    /// Items that survived the inbound chain.
    pub fn inbound_stream(&self) -> broadcast::Receiver<Element> {
        self.inner.inbound.subscribe()
    }

    /// Items that survived the outbound chain, ready for the transport.
    pub fn outbound_stream(&self) -> broadcast::Receiver<Element> {
        self.inner.outbound.subscribe()
    }

    /// Stage failures raised while processing inbound items.
    pub fn inbound_errors(&self) -> broadcast::Receiver<StageError> {
        self.inner.inbound.subscribe_errors()
    }

    /// Stage failures raised while processing outbound items.
    pub fn outbound_errors(&self) -> broadcast::Receiver<StageError> {
        self.inner.outbound.subscribe_errors()
    }

    /// Move to `Running` and dispatch any items enqueued while stopped,
    /// in their original order.
    pub fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                PipelineState::Disposed => return Err(PipelineError::Disposed.into()),
                PipelineState::Running => return Ok(()),
                PipelineState::Initialized | PipelineState::Stopped => {
                    *state = PipelineState::Running;
                    self.inner.state_tx.send_replace(PipelineState::Running);
                }
            }
        }
        log::debug!("pipeline started");
        for named in self.snapshot() {
            let ctx = self.context_for(&named);
            named.stage.on_activate(&ctx);
        }
        self.drain(&self.inner.inbound);
        self.drain(&self.inner.outbound);
        Ok(())
    }

    /// Move to `Stopped`. Items already enqueued stay enqueued; new items
    /// are enqueued until the next `start`.
    pub fn stop_now(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            PipelineState::Disposed => Err(PipelineError::Disposed.into()),
            PipelineState::Stopped | PipelineState::Initialized => Ok(()),
            PipelineState::Running => {
                *state = PipelineState::Stopped;
                self.inner.state_tx.send_replace(PipelineState::Stopped);
                log::debug!("pipeline stopped");
                Ok(())
            }
        }
    }

    /// Terminal transition: completes every observable and notifies all
    /// stages of their removal. Subsequent operations fail.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == PipelineState::Disposed {
                return;
            }
            *state = PipelineState::Disposed;
            self.inner.state_tx.send_replace(PipelineState::Disposed);
        }
        log::debug!("pipeline disposed");
        for named in self.snapshot() {
            let ctx = self.context_for(&named);
            named.stage.on_removed(&ctx);
        }
        self.inner.chain.lock().unwrap().clear();
        self.inner.inbound.complete();
        self.inner.outbound.complete();
    }

    /// Enqueue an inbound document at the head of the chain.
    pub fn read(&self, item: Element) -> Result<(), Error> {
        self.submit(&self.inner.inbound, item)
    }

    /// Enqueue an outbound document at the tail of the chain.
    pub fn write(&self, item: Element) -> Result<(), Error> {
        self.submit(&self.inner.outbound, item)
    }

    /// Insert a stage at the head of the chain.
    pub fn add_first(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), Error> {
        self.insert_at(name, stage, |_chain| Ok(0))
    }

    /// Insert a stage at the tail of the chain.
    pub fn add_last(&self, name: &str, stage: Arc<dyn Stage>) -> Result<(), Error> {
        self.insert_at(name, stage, |chain| Ok(chain.len()))
    }

    /// Insert a stage just before the named one.
    pub fn add_before(&self, anchor: &str, name: &str, stage: Arc<dyn Stage>) -> Result<(), Error> {
        self.insert_at(name, stage, |chain| position_of(chain, anchor))
    }

    /// Insert a stage just after the named one.
    pub fn add_after(&self, anchor: &str, name: &str, stage: Arc<dyn Stage>) -> Result<(), Error> {
        self.insert_at(name, stage, |chain| Ok(position_of(chain, anchor)? + 1))
    }

    /// Atomically swap the stage bound under `name`, returning the old
    /// instance.
    pub fn replace(&self, name: &str, stage: Arc<dyn Stage>) -> Result<Arc<dyn Stage>, Error> {
        self.check_not_disposed()?;
        let old = {
            let mut chain = self.inner.chain.lock().unwrap();
            let index = position_of(&chain, name)?;
            let old = chain[index].stage.clone();
            chain[index].stage = stage.clone();
            old
        };
        let named = NamedStage {
            name: name.to_owned(),
            stage,
        };
        let ctx = self.context_for(&named);
        old.on_removed(&ctx);
        named.stage.on_added(&ctx);
        if self.state() == PipelineState::Running {
            named.stage.on_activate(&ctx);
        }
        Ok(old)
    }

    /// Remove the named stage.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn Stage>, Error> {
        self.check_not_disposed()?;
        let named = {
            let mut chain = self.inner.chain.lock().unwrap();
            let index = position_of(&chain, name)?;
            chain.remove(index)
        };
        let ctx = self.context_for(&named);
        named.stage.on_removed(&ctx);
        Ok(named.stage)
    }

    /// Look up a stage by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        let chain = self.inner.chain.lock().unwrap();
        chain
            .iter()
            .find(|named| named.name == name)
            .map(|named| named.stage.clone())
    }

    /// The stage names, head to tail.
    pub fn stage_names(&self) -> Vec<String> {
        let chain = self.inner.chain.lock().unwrap();
        chain.iter().map(|named| named.name.clone()).collect()
    }

    /// Drop every item enqueued while stopped, in both directions. Used
    /// by the session when a connection is torn down so that leftovers
    /// of a dead stream cannot leak into the next one.
    pub(crate) fn clear_pending(&self) {
        self.inner.inbound.pending.lock().unwrap().clear();
        self.inner.outbound.pending.lock().unwrap().clear();
    }

    fn insert_at(
        &self,
        name: &str,
        stage: Arc<dyn Stage>,
        index: impl FnOnce(&[NamedStage]) -> Result<usize, Error>,
    ) -> Result<(), Error> {
        self.check_not_disposed()?;
        let named = NamedStage {
            name: name.to_owned(),
            stage,
        };
        {
            let mut chain = self.inner.chain.lock().unwrap();
            if chain.iter().any(|existing| existing.name == name) {
                return Err(PipelineError::DuplicateStage(name.to_owned()).into());
            }
            let index = index(&chain)?;
            chain.insert(index, named.clone());
        }
        let ctx = self.context_for(&named);
        named.stage.on_added(&ctx);
        if self.state() == PipelineState::Running {
            named.stage.on_activate(&ctx);
        }
        Ok(())
    }

    fn check_not_disposed(&self) -> Result<(), Error> {
        if self.state() == PipelineState::Disposed {
            return Err(PipelineError::Disposed.into());
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<NamedStage> {
        self.inner.chain.lock().unwrap().clone()
    }

    fn context_for(&self, named: &NamedStage) -> StageContext {
        StageContext::new(self.clone(), named.name.clone())
    }

    fn submit(&self, direction: &Direction, item: Element) -> Result<(), Error> {
        {
            let mut pending = direction.pending.lock().unwrap();
            match self.state() {
                PipelineState::Disposed => return Err(PipelineError::Disposed.into()),
                PipelineState::Initialized | PipelineState::Stopped => {
                    pending.push_back(item);
                    return Ok(());
                }
                PipelineState::Running => (),
            }
        }
        self.process(direction, item);
        Ok(())
    }

    fn drain(&self, direction: &Direction) {
        loop {
            let item = direction.pending.lock().unwrap().pop_front();
            match item {
                Some(item) => self.process(direction, item),
                None => break,
            }
        }
    }

    /// Walk one item through the chain. Serialized per direction.
    fn process(&self, direction: &Direction, item: Element) {
        let _guard = direction.process.lock().unwrap();
        // The pipeline may have been stopped or disposed while we were
        // waiting for the direction lock.
        match self.state() {
            PipelineState::Running => (),
            PipelineState::Disposed => return,
            PipelineState::Initialized | PipelineState::Stopped => {
                direction.pending.lock().unwrap().push_back(item);
                return;
            }
        }

        let chain = self.snapshot();
        let mut items = vec![item];
        let stages: Vec<&NamedStage> = match direction.kind {
            DirectionKind::Inbound => chain.iter().collect(),
            DirectionKind::Outbound => chain.iter().rev().collect(),
        };
        for named in stages {
            if items.is_empty() {
                break;
            }
            let ctx = self.context_for(named);
            let mut forwarded = Vec::with_capacity(items.len());
            for item in items {
                let result = match direction.kind {
                    DirectionKind::Inbound => named.stage.on_read(&ctx, item),
                    DirectionKind::Outbound => named.stage.on_write(&ctx, item),
                };
                match result {
                    Ok(mut outputs) => forwarded.append(&mut outputs),
                    Err(error) => {
                        log::debug!("stage {:?} dropped an item: {}", named.name, error);
                        let report = StageError {
                            stage: named.name.clone(),
                            error: Arc::new(error),
                        };
                        if let Some(tx) = direction.error_tx.lock().unwrap().as_ref() {
                            let _ = tx.send(report);
                        }
                    }
                }
            }
            items = forwarded;
        }
        if let Some(tx) = direction.stream_tx.lock().unwrap().as_ref() {
            for item in items {
                let _ = tx.send(item);
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new()
    }
}

fn position_of(chain: &[NamedStage], name: &str) -> Result<usize, Error> {
    chain
        .iter()
        .position(|named| named.name == name)
        .ok_or_else(|| PipelineError::NoSuchStage(name.to_owned()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc(text: &str) -> Element {
        Element::builder("message", crate::ns::JABBER_CLIENT)
            .append(text.to_owned())
            .build()
    }

    /// Tags every item it sees so ordering and direction are observable.
    struct Tagger {
        tag: &'static str,
    }

    impl Stage for Tagger {
        fn on_read(&self, _ctx: &StageContext, mut item: Element) -> Result<Vec<Element>, Error> {
            item.set_attr("tags", tag_of(&item, self.tag));
            Ok(vec![item])
        }

        fn on_write(&self, _ctx: &StageContext, mut item: Element) -> Result<Vec<Element>, Error> {
            item.set_attr("tags", tag_of(&item, self.tag));
            Ok(vec![item])
        }
    }

    fn tag_of(item: &Element, tag: &str) -> String {
        match item.attr("tags") {
            Some(prev) => format!("{},{}", prev, tag),
            None => tag.to_owned(),
        }
    }

    struct Failing;

    impl Stage for Failing {
        fn on_read(&self, _ctx: &StageContext, _item: Element) -> Result<Vec<Element>, Error> {
            Err(crate::error::ProtocolError::NotAStanza.into())
        }
    }

    struct Counter {
        added: AtomicUsize,
        removed: AtomicUsize,
        activated: AtomicUsize,
    }

    impl Counter {
        fn new() -> Counter {
            Counter {
                added: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
                activated: AtomicUsize::new(0),
            }
        }
    }

    impl Stage for Arc<Counter> {
        fn on_added(&self, _ctx: &StageContext) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn on_removed(&self, _ctx: &StageContext) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_activate(&self, _ctx: &StageContext) {
            self.activated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn inbound_walks_head_to_tail_outbound_reverse() {
        let pipeline = Pipeline::new();
        pipeline
            .add_last("a", Arc::new(Tagger { tag: "a" }))
            .unwrap();
        pipeline
            .add_last("b", Arc::new(Tagger { tag: "b" }))
            .unwrap();
        let mut inbound = pipeline.inbound_stream();
        let mut outbound = pipeline.outbound_stream();
        pipeline.start().unwrap();

        pipeline.read(doc("in")).unwrap();
        let item = inbound.recv().await.unwrap();
        assert_eq!(item.attr("tags"), Some("a,b"));

        pipeline.write(doc("out")).unwrap();
        let item = outbound.recv().await.unwrap();
        assert_eq!(item.attr("tags"), Some("b,a"));
    }

    #[tokio::test]
    async fn stopped_pipeline_enqueues_and_start_flushes_in_order() {
        let pipeline = Pipeline::new();
        pipeline
            .add_last("a", Arc::new(Tagger { tag: "a" }))
            .unwrap();
        let mut inbound = pipeline.inbound_stream();

        pipeline.read(doc("one")).unwrap();
        pipeline.read(doc("two")).unwrap();
        assert!(inbound.try_recv().is_err());

        pipeline.start().unwrap();
        assert_eq!(inbound.recv().await.unwrap().text(), "one");
        assert_eq!(inbound.recv().await.unwrap().text(), "two");

        pipeline.stop_now().unwrap();
        pipeline.read(doc("three")).unwrap();
        assert!(inbound.try_recv().is_err());
        pipeline.start().unwrap();
        assert_eq!(inbound.recv().await.unwrap().text(), "three");
    }

    #[tokio::test]
    async fn add_after_then_remove_restores_structure() {
        let pipeline = Pipeline::new();
        pipeline.add_last("a", Arc::new(PassThrough)).unwrap();
        pipeline.add_last("c", Arc::new(PassThrough)).unwrap();
        let before = pipeline.stage_names();
        let state_before = pipeline.state();

        pipeline.add_after("a", "b", Arc::new(PassThrough)).unwrap();
        assert_eq!(pipeline.stage_names(), ["a", "b", "c"]);
        pipeline.remove("b").unwrap();

        assert_eq!(pipeline.stage_names(), before);
        assert_eq!(pipeline.state(), state_before);
    }

    #[tokio::test]
    async fn failing_stage_drops_item_and_reports() {
        let pipeline = Pipeline::new();
        pipeline.add_last("boom", Arc::new(Failing)).unwrap();
        let mut inbound = pipeline.inbound_stream();
        let mut errors = pipeline.inbound_errors();
        pipeline.start().unwrap();

        pipeline.read(doc("x")).unwrap();
        let report = errors.recv().await.unwrap();
        assert_eq!(report.stage, "boom");
        assert!(inbound.try_recv().is_err());

        // The pipeline keeps running.
        assert_eq!(pipeline.state(), PipelineState::Running);
    }

    #[tokio::test]
    async fn replace_swaps_one_slot_and_fires_hooks() {
        let pipeline = Pipeline::new();
        let first = Arc::new(Counter::new());
        let second = Arc::new(Counter::new());
        pipeline.add_last("slot", Arc::new(first.clone())).unwrap();
        pipeline.start().unwrap();
        assert_eq!(first.activated.load(Ordering::SeqCst), 1);

        pipeline.replace("slot", Arc::new(second.clone())).unwrap();
        assert_eq!(first.removed.load(Ordering::SeqCst), 1);
        assert_eq!(second.added.load(Ordering::SeqCst), 1);
        assert_eq!(second.activated.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.stage_names(), ["slot"]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let pipeline = Pipeline::new();
        pipeline.add_last("a", Arc::new(PassThrough)).unwrap();
        let result = pipeline.add_first("a", Arc::new(PassThrough));
        assert!(matches!(
            result,
            Err(Error::Pipeline(PipelineError::DuplicateStage(_)))
        ));
    }

    #[tokio::test]
    async fn disposed_pipeline_rejects_operations() {
        let pipeline = Pipeline::new();
        let counter = Arc::new(Counter::new());
        pipeline.add_last("a", Arc::new(counter.clone())).unwrap();
        let mut inbound = pipeline.inbound_stream();
        pipeline.dispose();

        assert_eq!(counter.removed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pipeline.read(doc("x")),
            Err(Error::Pipeline(PipelineError::Disposed))
        ));
        assert!(matches!(
            pipeline.add_last("b", Arc::new(PassThrough)),
            Err(Error::Pipeline(PipelineError::Disposed))
        ));
        // Observables complete.
        assert!(matches!(
            inbound.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        // Dispose is idempotent.
        pipeline.dispose();
    }

    #[tokio::test]
    async fn consuming_stage_forwards_nothing() {
        struct Consume;
        impl Stage for Consume {
            fn on_read(&self, _ctx: &StageContext, _item: Element) -> Result<Vec<Element>, Error> {
                Ok(Vec::new())
            }
        }
        let pipeline = Pipeline::new();
        pipeline.add_last("eat", Arc::new(Consume)).unwrap();
        let mut inbound = pipeline.inbound_stream();
        pipeline.start().unwrap();
        pipeline.read(doc("x")).unwrap();
        assert!(inbound.try_recv().is_err());
    }
}
