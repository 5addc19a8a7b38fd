mod activation;
mod dispatch;
mod env;
mod restriction;
mod types;

pub use activation::{ActivePackage, Activation};
pub use dispatch::{dispatch, find_command};
pub use env::{
    flag_value, merge_flags, merge_path_list, remove_flag, LOAD_PATH_VAR, LOCKFILE_VAR, OPTS_VAR,
    PATH_VAR,
};
pub use restriction::LoadRestriction;
pub use types::ActivationOptions;
