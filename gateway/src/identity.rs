use experiments::types::ANONYMOUS_USER;
use http::{HeaderMap, HeaderName};

/// Works out who a request belongs to.
pub trait Identify: Send + Sync {
    /// The user id, or `None` for an anonymous request.
    fn identify(&self, headers: &HeaderMap) -> Option<String>;

    fn user_id(&self, headers: &HeaderMap) -> String {
        self.identify(headers)
            .unwrap_or_else(|| ANONYMOUS_USER.to_string())
    }
}

/// Reads the user id from a request header set by an upstream authenticator.
#[derive(Clone, Debug)]
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    pub fn new(header: HeaderName) -> Self {
        HeaderIdentity { header }
    }
}

impl Identify for HeaderIdentity {
    fn identify(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user_id| !user_id.is_empty())
            .map(str::to_string)
    }
}

/// Treats every request as anonymous.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousIdentity;

impl Identify for AnonymousIdentity {
    fn identify(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}
