// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;

use rudder_k8s::ResourceKey;

/// Terminal condition of a processed resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusState {
    Accepted,
    PartiallyAccepted,
    Orphaned,
    Conflicting,
    Invalid,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Accepted => "accepted",
            StatusState::PartiallyAccepted => "partially-accepted",
            StatusState::Orphaned => "orphaned",
            StatusState::Conflicting => "conflicting",
            StatusState::Invalid => "invalid",
        }
    }

    /// Severity rank; a more severe state overwrites a less severe one for
    /// the same resource.
    fn severity(&self) -> u8 {
        match self {
            StatusState::Accepted => 0,
            StatusState::PartiallyAccepted => 1,
            StatusState::Orphaned => 2,
            StatusState::Conflicting => 3,
            StatusState::Invalid => 4,
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceStatus {
    pub state: StatusState,
    pub description: String,
}

/// Per-build replacement of every processed resource's status.
pub type StatusMap = BTreeMap<ResourceKey, ResourceStatus>;

/// Records `state` for `key`, keeping the more severe of the existing and the
/// new state. Equal severity keeps the first description.
pub fn record(statuses: &mut StatusMap, key: ResourceKey, state: StatusState, description: impl Into<String>) {
    let description = description.into();
    match statuses.get_mut(&key) {
        Some(existing) if existing.state.severity() >= state.severity() => {}
        Some(existing) => {
            existing.state = state;
            existing.description = description;
        }
        None => {
            statuses.insert(key, ResourceStatus { state, description });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_k8s::{ObjectKey, ResourceKind};

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new(ResourceKind::HttpProxy, ObjectKey::new("default", name))
    }

    #[test]
    fn more_severe_state_wins() {
        let mut statuses = StatusMap::new();
        record(&mut statuses, key("a"), StatusState::Accepted, "valid HTTPProxy");
        record(&mut statuses, key("a"), StatusState::Invalid, "missing secret");
        record(&mut statuses, key("a"), StatusState::PartiallyAccepted, "one bad route");

        let status = &statuses[&key("a")];
        assert_eq!(status.state, StatusState::Invalid);
        assert_eq!(status.description, "missing secret");
    }

    #[test]
    fn equal_severity_keeps_first_description() {
        let mut statuses = StatusMap::new();
        record(&mut statuses, key("a"), StatusState::Invalid, "first");
        record(&mut statuses, key("a"), StatusState::Invalid, "second");
        assert_eq!(statuses[&key("a")].description, "first");
    }
}
