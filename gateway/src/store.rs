//! Where a request's experiments are persisted between requests.

use crate::cookies;
use crate::metrics_defs::COOKIE_WRITES;
use experiments::CookieState;
use experiments::codec::{self, Decoded};
use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderValue};
use shared::counter;

/// What to do with the stored experiments once the inner service has answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CookieUpdate {
    Set(String),
    Clear,
    Unchanged,
}

/// Persistence of the encoded experiments of a user.
pub trait ExperimentStore: Send + Sync {
    /// Stored experiments of `user_id` for the request carrying `headers`.
    fn read(&self, headers: &HeaderMap, user_id: &str) -> Decoded;

    /// Persists `update`, adding whatever the response needs to `headers`.
    fn write(&self, user_id: &str, update: &CookieUpdate, headers: &mut HeaderMap);
}

/// Keeps experiments in a base64 encoded cookie.
#[derive(Clone, Debug)]
pub struct CookieStore {
    cookie_name: String,
}

impl CookieStore {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        CookieStore {
            cookie_name: cookie_name.into(),
        }
    }

    fn header_value(&self, update: &CookieUpdate) -> Option<HeaderValue> {
        let (action, value) = match update {
            CookieUpdate::Set(raw) => ("set", cookies::set_cookie(&self.cookie_name, raw)),
            CookieUpdate::Clear => ("clear", cookies::clear_cookie(&self.cookie_name)),
            CookieUpdate::Unchanged => return None,
        };

        match HeaderValue::from_str(&value) {
            Ok(value) => {
                counter!(COOKIE_WRITES, "action" => action).increment(1);
                Some(value)
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not build Set-Cookie header");
                None
            }
        }
    }
}

impl ExperimentStore for CookieStore {
    fn read(&self, headers: &HeaderMap, user_id: &str) -> Decoded {
        let Some(value) = cookies::read_cookie(headers, &self.cookie_name) else {
            return codec::decode(None, user_id);
        };

        match cookies::decode_transport(value) {
            Ok(raw) => codec::decode(Some(&raw), user_id),
            Err(err) => {
                tracing::debug!(error = %err, "discarding undecodable experiments cookie");
                Decoded {
                    state: CookieState::new_user(user_id),
                    invalidate: true,
                }
            }
        }
    }

    fn write(&self, _user_id: &str, update: &CookieUpdate, headers: &mut HeaderMap) {
        if let Some(value) = self.header_value(update) {
            headers.append(SET_COOKIE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::COOKIE;

    fn with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_read() {
        let store = CookieStore::new("xpr.config");

        let missing = store.read(&HeaderMap::new(), "user-1");
        assert!(!missing.invalidate);
        assert_eq!(missing.state, CookieState::new_user("user-1"));

        let raw = "u:user-1«b:42╣app:«s:abc«d:{\"dark_mode\":true}║╣shared:«s:«d:{}║";
        let headers = with_cookie(&format!(
            "other=1; xpr.config={}",
            cookies::encode_transport(raw)
        ));
        let stored = store.read(&headers, "user-1");
        assert!(!stored.invalidate);
        assert!(stored.state.experiments.is_some());

        let corrupt = store.read(&with_cookie("xpr.config=%%%"), "user-1");
        assert!(corrupt.invalidate);
        assert_eq!(corrupt.state, CookieState::new_user("user-1"));
    }

    #[test]
    fn test_write() {
        let store = CookieStore::new("xpr.config");

        let mut headers = HeaderMap::new();
        store.write("user-1", &CookieUpdate::Unchanged, &mut headers);
        assert!(headers.is_empty());

        store.write("user-1", &CookieUpdate::Clear, &mut headers);
        store.write("user-1", &CookieUpdate::Set("u:a«b:1".into()), &mut headers);

        let values: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values[0].contains("Max-Age=0"));
        assert!(values[1].starts_with("xpr.config="));
        assert!(values[1].contains("HttpOnly"));
    }
}
