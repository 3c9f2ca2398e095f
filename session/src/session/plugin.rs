// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The plugin registry.
//!
//! Plugins are identified by their concrete type. They are constructed
//! with a [`SessionHandle`][`crate::session::SessionHandle`] back
//! reference, subscribe to the inbound stanza stream and use the send
//! surfaces of the session.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::Session;

/// An iq payload a plugin claims responsibility for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IqSignature {
    /// The payload element's namespace.
    pub namespace: String,
    /// The payload element's local name.
    pub element: String,
}

impl IqSignature {
    /// Build a signature.
    pub fn new(namespace: &str, element: &str) -> IqSignature {
        IqSignature {
            namespace: namespace.to_owned(),
            element: element.to_owned(),
        }
    }
}

/// A unit of optional functionality attached to a session.
pub trait Plugin: Any + Send + Sync {
    /// XEP-0030 feature URIs this plugin makes the client advertise.
    fn features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Inbound iq payloads this plugin answers.
    ///
    /// An inbound iq `get`/`set` whose payload matches no registered
    /// signature is answered with `feature-not-implemented` by the
    /// session itself.
    fn supported_iqs(&self) -> Vec<IqSignature> {
        Vec::new()
    }
}

/// Construction protocol for plugins, used by
/// [`Session::apply`][`crate::session::Session::apply`].
pub trait PluginInit: Plugin + Sized {
    /// Build the plugin against a session.
    ///
    /// Implementations should store `session.handle()` rather than the
    /// session itself; the registry must not keep its owner alive.
    fn init(session: &Session) -> Self;

    /// Apply the plugins this one depends on, by calling
    /// `session.apply::<Dep>()` for each. Runs before [`PluginInit::init`].
    fn register_dependencies(session: &Session) {
        let _ = session;
    }
}

pub(crate) struct PluginManager {
    by_type: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
}

impl PluginManager {
    pub fn new() -> PluginManager {
        PluginManager {
            by_type: Mutex::new(HashMap::new()),
            plugins: Mutex::new(Vec::new()),
        }
    }

    pub fn get<P: Plugin>(&self) -> Option<Arc<P>> {
        let by_type = self.by_type.lock().unwrap();
        by_type
            .get(&TypeId::of::<P>())
            .cloned()
            .and_then(|any| any.downcast::<P>().ok())
    }

    /// Register `plugin` unless its type is already present. Returns the
    /// registered instance either way.
    pub fn insert<P: Plugin>(&self, plugin: Arc<P>) -> Arc<P> {
        let mut by_type = self.by_type.lock().unwrap();
        if let Some(existing) = by_type
            .get(&TypeId::of::<P>())
            .cloned()
            .and_then(|any| any.downcast::<P>().ok())
        {
            return existing;
        }
        by_type.insert(
            TypeId::of::<P>(),
            plugin.clone() as Arc<dyn Any + Send + Sync>,
        );
        self.plugins
            .lock()
            .unwrap()
            .push(plugin.clone() as Arc<dyn Plugin>);
        plugin
    }

    /// Whether any registered plugin answers this iq payload.
    pub fn supports_iq(&self, namespace: &str, element: &str) -> bool {
        let plugins = self.plugins.lock().unwrap();
        plugins.iter().any(|plugin| {
            plugin
                .supported_iqs()
                .iter()
                .any(|sig| sig.namespace == namespace && sig.element == element)
        })
    }

    /// Union of the feature URIs of all registered plugins.
    pub fn features(&self) -> Vec<String> {
        let plugins = self.plugins.lock().unwrap();
        let mut features: Vec<String> = plugins
            .iter()
            .flat_map(|plugin| plugin.features())
            .collect();
        features.sort();
        features.dedup();
        features
    }
}
