//! Dotted subject names used for KV keys and bus routing.

use crate::key::ObjectKey;

/// Reply header carrying an HTTP-style status.
pub const HEADER_STATUS: &str = "Keel-Status";
/// Apply: field manager name.
pub const HEADER_MANAGER: &str = "Keel-Manager";
/// Apply: take ownership of conflicting fields.
pub const HEADER_FORCE: &str = "Keel-Force";
/// Delete: grace period in seconds.
pub const HEADER_GRACE: &str = "Keel-Grace";

/// Match a subject against a pattern. `*` matches one token, a trailing `>` one or more.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn validate_create(kind: &str) -> String {
    format!("keel.validate.create.{}", kind)
}

pub fn validate_update(kind: &str) -> String {
    format!("keel.validate.update.{}", kind)
}

/// Store command subject, e.g. `keel.store.apply.widget.team.a`.
pub fn store(command: &str, key: &ObjectKey) -> String {
    format!("keel.store.{}.{}", command, key)
}

pub const STORE_ALL: &str = "keel.store.>";

pub fn broker(key: &ObjectKey, action: &str) -> String {
    format!("keel.broker.{}.{}", key, action)
}

pub const BROKER_ALL: &str = "keel.broker.>";

pub fn advertise(key: &ObjectKey, action: &str) -> String {
    format!("keel.actor.advertise.{}.{}", key, action)
}

pub fn run(key: &ObjectKey, action: &str, actor_id: &str) -> String {
    format!("keel.actor.run.{}.{}.{}", key, action, actor_id)
}

/// Split the tail of a subject after `prefix_tokens` leading tokens.
pub fn tail(subject: &str, prefix_tokens: usize) -> Vec<&str> {
    subject.split('.').skip(prefix_tokens).collect()
}
