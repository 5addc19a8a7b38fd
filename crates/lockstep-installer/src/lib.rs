mod layout;
mod materializer;
mod receipts;
mod types;

pub use layout::{default_user_home, vcs_cache_dir, InstallLayout, DEFAULT_INSTALL_DIR};
pub use materializer::{active_specs, missing_packages, Materializer, UNIT_MARKER};
pub use receipts::{prune_receipts, read_install_receipts, write_install_receipt};
pub use types::{InstallOptions, InstallReceipt, InstalledPackage};
