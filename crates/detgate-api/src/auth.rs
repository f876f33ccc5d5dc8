//! Pluggable request authentication.
//!
//! The gateway does not own an identity scheme; it asks a
//! [`RequestAuthenticator`] at the endpoint boundary. With no keys
//! configured every request is allowed.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use axum::http::HeaderMap;
use thiserror::Error;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter carrying the API key. Browser WebSocket clients cannot
/// set custom headers.
pub const API_KEY_QUERY_PARAM: &str = "api_key";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,

    #[error("invalid credentials")]
    Invalid,
}

/// Authentication check at the endpoint boundary.
pub trait RequestAuthenticator: Send + Sync {
    /// Scheme name for logs.
    fn scheme(&self) -> &'static str;

    /// Accept or reject a request from its headers and raw query string.
    fn authenticate(&self, headers: &HeaderMap, query: Option<&str>) -> Result<(), AuthError>;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl RequestAuthenticator for AllowAll {
    fn scheme(&self) -> &'static str {
        "none"
    }

    fn authenticate(&self, _headers: &HeaderMap, _query: Option<&str>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Static API key check.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    keys: HashSet<String>,
}

impl ApiKeyAuth {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }

    /// The key from the header, else from the percent-decoded query string.
    fn presented<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<Cow<'a, str>> {
        if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            return Some(Cow::Borrowed(value));
        }
        url::form_urlencoded::parse(query?.as_bytes())
            .find(|(name, _)| name == API_KEY_QUERY_PARAM)
            .map(|(_, value)| value)
    }
}

impl RequestAuthenticator for ApiKeyAuth {
    fn scheme(&self) -> &'static str {
        "api_key"
    }

    fn authenticate(&self, headers: &HeaderMap, query: Option<&str>) -> Result<(), AuthError> {
        match Self::presented(headers, query).as_deref() {
            None | Some("") => Err(AuthError::Missing),
            Some(key) if self.keys.contains(key) => Ok(()),
            Some(_) => Err(AuthError::Invalid),
        }
    }
}

/// Build the authenticator for a key list; no keys means no authentication.
pub fn from_keys(keys: &[String]) -> Arc<dyn RequestAuthenticator> {
    if keys.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(ApiKeyAuth::new(keys.iter().cloned()))
    }
}
