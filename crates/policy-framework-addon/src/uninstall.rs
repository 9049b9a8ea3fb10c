use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Set by the lifecycle controller while the addon is being torn down.
/// Reconcilers only read it.
#[derive(Clone, Debug, Default)]
pub struct UninstallFlag(Arc<AtomicBool>);

impl UninstallFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_uninstalling(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_uninstalling(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}
