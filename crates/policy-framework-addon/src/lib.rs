pub mod allow_list;
pub mod cancel;
pub mod config;
pub mod crds;
pub mod defaults;
pub mod discovery;
pub mod error;
pub mod events;
pub mod spec_sync;
pub mod store;
pub mod template_sync;
pub mod uninstall;

#[cfg(test)]
pub(crate) mod testing;
