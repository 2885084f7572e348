//! Rate limit key generation.
//!
//! A keygen maps an inbound request to the key whose limiter should gate it.

use std::collections::{HashMap, HashSet};

/// What a keygen decided for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Limit the request under this key
    Key(String),
    /// Let the request through without limiting it
    Exempt,
    /// Refuse the request before limiting, with a reason
    Reject(String),
}

/// Produces a rate limit key for a request of type `R`.
///
/// Implemented for any `Fn(&R) -> KeyOutcome`.
pub trait Keygen<R: ?Sized>: Send + Sync {
    fn key(&self, request: &R) -> KeyOutcome;
}

impl<R, F> Keygen<R> for F
where
    R: ?Sized,
    F: Fn(&R) -> KeyOutcome + Send + Sync,
{
    fn key(&self, request: &R) -> KeyOutcome {
        self(request)
    }
}

/// Read access to request headers.
pub trait HeaderLookup {
    /// Value of the header `name`, matched case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderLookup for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)
            .or_else(|| {
                self.iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }
}

/// Keys requests by the value of one header.
///
/// Requests without the header are rejected. Values listed as exception keys
/// are exempt from limiting.
#[derive(Debug, Clone)]
pub struct HeaderKeygen {
    header_name: String,
    exception_keys: HashSet<String>,
}

impl HeaderKeygen {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            exception_keys: HashSet::new(),
        }
    }

    /// Exempt requests carrying any of these header values.
    pub fn with_exception_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exception_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }
}

impl<R> Keygen<R> for HeaderKeygen
where
    R: HeaderLookup + ?Sized,
{
    fn key(&self, request: &R) -> KeyOutcome {
        match request.header(&self.header_name).filter(|v| !v.is_empty()) {
            Some(value) if self.exception_keys.contains(value) => KeyOutcome::Exempt,
            Some(value) => KeyOutcome::Key(value.to_string()),
            None => KeyOutcome::Reject(format!("header key {:?} is missing", self.header_name)),
        }
    }
}
