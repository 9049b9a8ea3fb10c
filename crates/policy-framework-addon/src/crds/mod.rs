pub mod configuration_policy;
pub mod policy;
