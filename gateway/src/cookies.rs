//! Cookie header plumbing. The experiments cookie travels base64 encoded since its
//! text form contains characters not allowed in cookie values.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use http::header::COOKIE;

/// One year.
pub const MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("cookie is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("cookie is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Value of the first cookie called `name` across all `Cookie` headers.
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim().trim_matches('"'))
        })
}

pub fn encode_transport(raw: &str) -> String {
    STANDARD.encode(raw)
}

pub fn decode_transport(value: &str) -> Result<String, TransportError> {
    let bytes = STANDARD.decode(value)?;
    Ok(String::from_utf8(bytes)?)
}

/// `Set-Cookie` value storing `raw` for a year.
pub fn set_cookie(name: &str, raw: &str) -> String {
    format!(
        "{name}={}; Path=/; Max-Age={MAX_AGE_SECS}; HttpOnly",
        encode_transport(raw)
    )
}

/// `Set-Cookie` value that makes the browser drop the cookie.
pub fn clear_cookie(name: &str) -> String {
    format!("{name}=; Path=/; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly")
}
