use serde::{Deserialize, Serialize};

/// Error taxonomy shared by the store, controllers, watchers and the broker.
///
/// Every variant carries a human-readable message and maps onto an HTTP-style status so
/// errors survive a trip over the bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("locked: {0}")]
    Locked(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("no responders: {0}")]
    NoResponders(String),
    #[error("panic: {0}")]
    Panic(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Locked(_) => 423,
            Error::Validation(_) => 422,
            Error::BadRequest(_) => 400,
            Error::Timeout(_) => 408,
            Error::NoResponders(_) => 503,
            Error::Panic(_) | Error::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Locked(m)
            | Error::Validation(m)
            | Error::BadRequest(m)
            | Error::Timeout(m)
            | Error::NoResponders(m)
            | Error::Panic(m)
            | Error::Internal(m) => m,
        }
    }

    /// Rebuild an error from a status and message received from a peer.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let m = message.into();
        match status {
            404 => Error::NotFound(m),
            409 => Error::Conflict(m),
            423 => Error::Locked(m),
            422 => Error::Validation(m),
            400 => Error::BadRequest(m),
            408 => Error::Timeout(m),
            503 => Error::NoResponders(m),
            _ => Error::Internal(m),
        }
    }

    /// Prefix the message, keeping the variant.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        let wrap = |m: String| format!("{}: {}", ctx, m);
        match self {
            Error::NotFound(m) => Error::NotFound(wrap(m)),
            Error::Conflict(m) => Error::Conflict(wrap(m)),
            Error::Locked(m) => Error::Locked(wrap(m)),
            Error::Validation(m) => Error::Validation(wrap(m)),
            Error::BadRequest(m) => Error::BadRequest(wrap(m)),
            Error::Timeout(m) => Error::Timeout(wrap(m)),
            Error::NoResponders(m) => Error::NoResponders(wrap(m)),
            Error::Panic(m) => Error::Panic(wrap(m)),
            Error::Internal(m) => Error::Internal(wrap(m)),
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict(_)) }
    pub fn is_locked(&self) -> bool { matches!(self, Error::Locked(_)) }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody { status: self.status(), message: self.message().to_string() }
    }
}

/// Turn `NotFound` into `Ok(None)`.
pub fn ignore_not_found<T>(r: Result<T>) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl From<keel_apply::Conflict> for Error {
    fn from(c: keel_apply::Conflict) -> Self {
        Error::Conflict(c.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(format!("invalid json: {}", e))
    }
}

/// Error payload carried in bus replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub message: String,
}

impl From<ErrorBody> for Error {
    fn from(b: ErrorBody) -> Self {
        Error::from_status(b.status, b.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_for_distinct_variants() {
        for e in [
            Error::NotFound("x".into()),
            Error::Conflict("x".into()),
            Error::Locked("x".into()),
            Error::Validation("x".into()),
            Error::BadRequest("x".into()),
            Error::Timeout("x".into()),
            Error::NoResponders("x".into()),
            Error::Internal("x".into()),
        ] {
            assert_eq!(Error::from_status(e.status(), "x"), e);
        }
        assert_eq!(Error::Panic("boom".into()).status(), 500);
    }

    #[test]
    fn context_keeps_variant() {
        let e = Error::Conflict("revision 3".into()).context("widget.t.a");
        assert!(e.is_conflict());
        assert_eq!(e.message(), "widget.t.a: revision 3");
    }

    #[test]
    fn ignore_not_found_only_swallows_not_found() {
        assert_eq!(ignore_not_found::<u8>(Err(Error::NotFound("k".into()))), Ok(None));
        assert!(ignore_not_found::<u8>(Err(Error::Locked("k".into()))).is_err());
        assert_eq!(ignore_not_found(Ok(1)), Ok(Some(1)));
    }
}
