// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The stage contract of the processing pipeline.

use minidom::Element;

use crate::error::Error;
use crate::pipeline::Pipeline;

/// Context handed to a stage hook.
///
/// It identifies the stage's slot and gives access to the owning
/// pipeline, primarily so that a stage handling inbound traffic can emit
/// outbound documents of its own.
pub struct StageContext {
    pipeline: Pipeline,
    name: String,
}

impl StageContext {
    pub(crate) fn new(pipeline: Pipeline, name: String) -> StageContext {
        StageContext { pipeline, name }
    }

    /// The name under which the stage is registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pipeline the stage is installed in.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Submit a document to the pipeline's outbound chain.
    ///
    /// Must not be called from within `on_write`: the outbound direction
    /// is busy processing the very item that hook was invoked for.
    pub fn send(&self, item: Element) -> Result<(), Error> {
        self.pipeline.write(item)
    }
}

/// A single stage of the pipeline.
///
/// Every hook has a pass-through default. `on_read`/`on_write` return the
/// documents to forward to the next stage; returning an empty vector
/// consumes the item, returning an `Err` drops the item and publishes the
/// error on the direction's error stream.
pub trait Stage: Send + Sync + 'static {
    /// An inbound document reached this stage.
    fn on_read(&self, ctx: &StageContext, item: Element) -> Result<Vec<Element>, Error> {
        let _ = ctx;
        Ok(vec![item])
    }

    /// An outbound document reached this stage.
    fn on_write(&self, ctx: &StageContext, item: Element) -> Result<Vec<Element>, Error> {
        let _ = ctx;
        Ok(vec![item])
    }

    /// The stage was inserted into a pipeline.
    fn on_added(&self, _ctx: &StageContext) {}

    /// The stage was removed from the pipeline, or the pipeline was
    /// disposed.
    fn on_removed(&self, _ctx: &StageContext) {}

    /// The pipeline entered the running state (or the stage was added to
    /// an already-running pipeline).
    fn on_activate(&self, _ctx: &StageContext) {}
}

/// A stage that forwards every item unchanged.
pub struct PassThrough;

impl Stage for PassThrough {}
