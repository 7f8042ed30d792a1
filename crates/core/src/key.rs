use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static token regex"));

pub const WILDCARD: &str = "*";

/// True when `s` is usable as a key or subject token.
pub fn is_valid_token(s: &str) -> bool {
    TOKEN.is_match(s)
}

/// Identity of a stored object. Rendered as `kind.account.name`; empty parts become `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub account: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, account: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), account: account.into(), name: name.into() }
    }

    /// Pattern over every object of `kind` (all kinds when empty).
    pub fn kind_pattern(kind: &str) -> Self {
        Self::new(kind, "", "")
    }

    pub fn all() -> Self { Self::default() }

    /// Fail unless every part is a concrete token.
    pub fn validate(&self) -> Result<()> {
        for (what, v) in [("kind", &self.kind), ("account", &self.account), ("name", &self.name)] {
            if !is_valid_token(v) {
                return Err(Error::BadRequest(format!("invalid {} {:?} in key {}", what, v, self)));
            }
        }
        Ok(())
    }

    /// Same check as [`validate`](Self::validate) but allows empty or `*` parts.
    pub fn validate_pattern(&self) -> Result<()> {
        for (what, v) in [("kind", &self.kind), ("account", &self.account), ("name", &self.name)] {
            if !(v.is_empty() || v == WILDCARD || is_valid_token(v)) {
                return Err(Error::BadRequest(format!("invalid {} {:?} in pattern {}", what, v, self)));
            }
        }
        Ok(())
    }

    pub fn is_pattern(&self) -> bool {
        [&self.kind, &self.account, &self.name].iter().any(|v| v.is_empty() || v.as_str() == WILDCARD)
    }
}

fn part(v: &str) -> &str {
    if v.is_empty() { WILDCARD } else { v }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", part(&self.kind), part(&self.account), part(&self.name))
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut it = s.split('.');
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(kind), Some(account), Some(name), None) => Ok(ObjectKey::new(kind, account, name)),
            _ => Err(Error::BadRequest(format!("invalid object key {:?}: expected kind.account.name", s))),
        }
    }
}
