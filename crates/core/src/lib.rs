//! Keel core types: object envelope, keys, selectors, reconcile outcomes and errors.

#![forbid(unsafe_code)]

mod error;
mod key;
mod object;
mod reconcile;
mod selector;
pub mod subject;

pub use error::{ignore_not_found, Error, ErrorBody, Result};
pub use key::{is_valid_token, ObjectKey, WILDCARD};
pub use object::{decode, MetaOnly, Object, ObjectMeta, OwnerReference};
pub use reconcile::{Event, EventOperation, Outcome, Request};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};

/// Default durations that several crates agree on.
pub mod defaults {
    use std::time::Duration;

    pub const MUTEX_TTL: Duration = Duration::from_secs(30);
    pub const WATCH_ACK_WAIT: Duration = Duration::from_secs(5);
    pub const WATCH_BACKOFF: Duration = Duration::from_secs(1);
    pub const ADVERTISE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Read an env var, falling back to `default` when unset or unparsable.
pub fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

pub mod prelude {
    pub use super::{Error, Event, EventOperation, Object, ObjectKey, ObjectMeta, Outcome, Request, Result};
}
