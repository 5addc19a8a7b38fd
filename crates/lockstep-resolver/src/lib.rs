mod constraints;
mod drift;
mod order;
mod policy;
mod resolve;
mod search;
mod types;

pub use drift::{detect_drift, Drift, DriftReason};
pub use order::install_order;
pub use policy::refreshed_sources;
pub use resolve::Resolver;
pub use types::{LockPolicy, ResolveOptions, UpdateScope};

#[cfg(test)]
mod tests;
