//! Subscription matching
//!
//! An event set entry is one of:
//! - `*` for every event
//! - `prefix.*` for every event below a dot-separated prefix (`run.*`)
//! - an exact event name (`run.failed`)
//!
//! Matching compares segments and never evaluates user-supplied regexes.

use crate::{
    events::{is_valid_segment, validate_event_name, MAX_EVENT_NAME_LEN},
    subscription::WebhookConfig,
    Result, WebhookError,
};

/// Parsed subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionPattern {
    All,
    Exact(String),
    /// Matches names that start with these segments and have at least one more
    Prefix(String),
}

impl SubscriptionPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(Self::All);
        }
        if pattern.len() > MAX_EVENT_NAME_LEN {
            return Err(WebhookError::InvalidPattern(format!(
                "pattern longer than {MAX_EVENT_NAME_LEN} characters"
            )));
        }

        if let Some(prefix) = pattern.strip_suffix(".*") {
            if prefix.split('.').all(is_valid_segment) {
                return Ok(Self::Prefix(prefix.to_string()));
            }
            return Err(WebhookError::InvalidPattern(pattern.to_string()));
        }

        validate_event_name(pattern)
            .map(|()| Self::Exact(pattern.to_string()))
            .map_err(|_| WebhookError::InvalidPattern(pattern.to_string()))
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(name) => name == event_type,
            Self::Prefix(prefix) => event_type
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|rest| !rest.is_empty()),
        }
    }
}

impl WebhookConfig {
    /// Whether any entry of the event set matches
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|entry| {
            SubscriptionPattern::parse(entry).is_ok_and(|pattern| pattern.matches(event_type))
        })
    }
}

/// Active configs subscribed to `event_type`
pub fn match_subscribers(event_type: &str, configs: &[WebhookConfig]) -> Vec<WebhookConfig> {
    configs
        .iter()
        .filter(|config| config.active && config.subscribes_to(event_type))
        .cloned()
        .collect()
}
