//! Event type allow/deny policy

use crate::error::GatewayError;
use std::collections::HashSet;

/// Event types dropped when no policy is configured
pub const DEFAULT_DENIED: &[&str] = &["CHANNEL_PINS_UPDATE", "MESSAGE_UPDATE", "TYPING_START"];

/// Set-membership policy applied to dispatch type names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Only the listed types are published
    Allow(HashSet<String>),
    /// Every type except the listed ones is published
    Deny(HashSet<String>),
}

impl EventFilter {
    pub fn allow<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Allow(types.into_iter().map(Into::into).collect())
    }

    pub fn deny<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Deny(types.into_iter().map(Into::into).collect())
    }

    /// Build from the two configured lists; setting both is an error
    pub fn from_lists(allow: Vec<String>, deny: Vec<String>) -> Result<Self, GatewayError> {
        match (allow.is_empty(), deny.is_empty()) {
            (true, true) => Ok(Self::default()),
            (false, true) => Ok(Self::allow(allow)),
            (true, false) => Ok(Self::deny(deny)),
            (false, false) => Err(GatewayError::Config(
                "GATEWAY_EVENT_ALLOW and GATEWAY_EVENT_DENY are mutually exclusive".to_string(),
            )),
        }
    }

    /// Whether an event of this type should be published
    pub fn permits(&self, event_type: &str) -> bool {
        match self {
            Self::Allow(types) => types.contains(event_type),
            Self::Deny(types) => !types.contains(event_type),
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::deny(DEFAULT_DENIED.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_drops_noisy_events() {
        let filter = EventFilter::default();
        assert!(!filter.permits("TYPING_START"));
        assert!(!filter.permits("MESSAGE_UPDATE"));
        assert!(filter.permits("MESSAGE_CREATE"));
    }

    #[test]
    fn allow_list_admits_only_members() {
        let filter = EventFilter::allow(["GUILD_CREATE", "INTERACTION_CREATE"]);
        assert!(filter.permits("GUILD_CREATE"));
        assert!(!filter.permits("MESSAGE_CREATE"));
    }

    #[test]
    fn both_lists_are_rejected() {
        let result = EventFilter::from_lists(vec!["A".into()], vec!["B".into()]);
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn empty_lists_fall_back_to_default() {
        let filter = EventFilter::from_lists(vec![], vec![]).unwrap();
        assert_eq!(filter, EventFilter::default());
    }
}
