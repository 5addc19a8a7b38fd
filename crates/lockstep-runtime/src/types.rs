use anyhow::{anyhow, Result};
use lockstep_core::GroupSelection;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationOptions {
    pub groups: GroupSelection,
    pub platform: Option<String>,
}

impl ActivationOptions {
    pub fn new(groups: GroupSelection) -> Self {
        Self {
            groups,
            platform: None,
        }
    }

    /// Every group except `groups`.
    pub fn without<I, S>(groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups = groups
            .into_iter()
            .map(Into::into)
            .map(|group: String| group.trim().to_string())
            .collect::<Vec<_>>();
        if groups.iter().any(String::is_empty) {
            return Err(anyhow!("group names must not be empty"));
        }
        Ok(Self::new(GroupSelection::without(groups)))
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn platform(&self) -> String {
        self.platform
            .clone()
            .unwrap_or_else(lockstep_core::current_platform)
    }
}
