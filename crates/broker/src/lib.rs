//! Keel broker.
//!
//! Invoking an action on an object takes two bus round trips. The broker first advertises
//! the request to every actor registered for the kind and action and takes the first actor
//! whose labels match the request's selector. It then sends the payload to that actor alone
//! with whatever remains of the caller's time budget, and relays the reply unchanged.

#![forbid(unsafe_code)]

mod actor;
mod broker;
mod client;

use std::time::Duration;

use keel_core::{defaults, env_or, LabelSelector};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use actor::{common_labels, Action, Actor};
pub use broker::{Broker, BROKER_QUEUE};
pub use client::BrokerClient;

/// Body of a broker request. The chosen actor receives it with `timeout_ms` cut down to
/// what is left after the advertise phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Total budget for both phases; zero means the broker default. On the run subject this
    /// is the actor's own deadline.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub data: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

/// Advertise phase: who can run this?
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseReply {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub advertise_timeout: Duration,
    /// Budget used when a request carries none.
    pub default_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { advertise_timeout: defaults::ADVERTISE_TIMEOUT, default_timeout: Duration::from_secs(30) }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            advertise_timeout: Duration::from_millis(env_or(
                "KEEL_ADVERTISE_TIMEOUT_MS",
                d.advertise_timeout.as_millis() as u64,
            )),
            default_timeout: Duration::from_secs(env_or("KEEL_BROKER_TIMEOUT_SECS", d.default_timeout.as_secs())),
        }
    }
}
