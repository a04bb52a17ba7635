use crate::error::{Error, Result};
use crate::types::{ActionId, ResourceId};
use std::fmt;

/// An `(action, resource)` pair owned by a role.
///
/// Ordering is by resource first so permission sets group naturally by
/// resource when iterated.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Permission {
    pub action: ActionId,
    pub resource: ResourceId,
}

impl Permission {
    /// Creates a permission from already validated identifiers.
    pub fn new(action: ActionId, resource: ResourceId) -> Self {
        Self { action, resource }
    }

    /// Parses the `resource:action` shorthand.
    ///
    /// The split happens at the last `:` so resource ids may themselves
    /// contain colons.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let trimmed = value.as_ref().trim();
        let (resource, action) = split_permission(trimmed).ok_or_else(|| {
            Error::InvalidInput("permission must be in resource:action format".to_string())
        })?;
        if resource.is_empty() || action.is_empty() {
            return Err(Error::InvalidInput(
                "permission must not have empty segments".to_string(),
            ));
        }
        Ok(Self {
            action: ActionId::new(action)?,
            resource: ResourceId::new(resource)?,
        })
    }

    /// Returns true when this permission grants `action` on any resource.
    pub fn has_action(&self, action: &ActionId) -> bool {
        &self.action == action
    }
}

impl Ord for Permission {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.resource
            .cmp(&other.resource)
            .then_with(|| self.action.cmp(&other.action))
    }
}

impl PartialOrd for Permission {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

impl TryFrom<&str> for Permission {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<(ActionId, ResourceId)> for Permission {
    fn from((action, resource): (ActionId, ResourceId)) -> Self {
        Self::new(action, resource)
    }
}

fn split_permission(value: &str) -> Option<(&str, &str)> {
    value.rsplit_once(':')
}
