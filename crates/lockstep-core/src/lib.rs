mod descriptor;
mod error;
mod graph;
mod manifest;
mod platform;
mod requirement;
mod source;
mod specification;

pub use descriptor::{PackageDescriptor, DESCRIPTOR_FILE};
pub use error::{classify, is_retryable, Conflict, Error, ManifestError, ResolutionFailure};
pub use graph::DependencyGraph;
pub use manifest::{Manifest, MANIFEST_FILE};
pub use platform::{current_platform, platform_compatible, GENERIC_PLATFORM};
pub use requirement::{Dependency, GroupSelection, Requirement, DEFAULT_GROUP};
pub use source::{SourceIdentity, SourceKind, VcsReference};
pub use specification::Specification;
