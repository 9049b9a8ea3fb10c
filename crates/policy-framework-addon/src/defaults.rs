//! Structural defaulting for generic objects through registered typed resources.

use std::collections::HashMap;

use kube::{Resource, api::DynamicObject, core::GroupVersionKind};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::ReconcileError;

/// Hook run after serde has filled field defaults.
pub trait Defaulted {
    fn apply_defaults(&mut self) {}
}

type DefaultFn = Box<dyn Fn(Value) -> Result<Value, serde_json::Error> + Send + Sync>;

/// Type registry keyed by group/version/kind.
#[derive(Default)]
pub struct Scheme {
    entries: HashMap<(String, String, String), DefaultFn>,
}

fn key(gvk: &GroupVersionKind) -> (String, String, String) {
    (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme with every typed resource this addon knows how to default.
    pub fn with_policy_types() -> Self {
        let mut scheme = Self::new();
        scheme.register::<crate::crds::configuration_policy::ConfigurationPolicy>();
        scheme
    }

    pub fn register<K>(&mut self)
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Defaulted + 'static,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        self.entries.insert(
            key(&gvk),
            Box::new(|raw| {
                let mut typed: K = serde_json::from_value(raw)?;
                typed.apply_defaults();
                serde_json::to_value(&typed)
            }),
        );
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.entries.contains_key(&key(gvk))
    }

    /// Replaces `object` with its defaulted form. Kinds the registry does not
    /// know are left as they are.
    pub fn apply_defaults(
        &self,
        gvk: &GroupVersionKind,
        object: &mut DynamicObject,
    ) -> Result<(), ReconcileError> {
        let Some(default_fn) = self.entries.get(&key(gvk)) else {
            return Ok(());
        };
        let wrap = |source| ReconcileError::Defaulting {
            kind: gvk.kind.clone(),
            source,
        };
        let raw = serde_json::to_value(&*object).map_err(wrap)?;
        let defaulted = default_fn(raw).map_err(wrap)?;
        *object = serde_json::from_value(defaulted).map_err(wrap)?;
        Ok(())
    }
}
