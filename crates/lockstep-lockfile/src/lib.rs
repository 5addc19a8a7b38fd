mod entry;
mod model;
mod reader;
mod writer;

pub use entry::LockEntry;
pub use model::{Lockfile, LOCKFILE_NAME};
