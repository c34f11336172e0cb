//! Text format of the experiments cookie.
//!
//! ```text
//! u:<user>«b:<bucket>╣app:«s:<stamp>«d:<dirty json>║╣shared:«s:<stamp>«d:<dirty json>║
//! ```
//!
//! Only dirty features travel in the cookie; everything else is recomputed from the
//! current configuration on each request. An unset bucket or stamp is written as the
//! empty string and read back as `None`.

use crate::metrics_defs::COOKIE_DECODE;
use crate::types::{
    CookieState, Domain, FeatureSnapshot, Features, PerDomain, Stamp, StoredExperiments,
};
use serde_json::Value;
use shared::counter;

const USER: &str = "u:";
const BUCKET: &str = "«b:";
const DOMAIN_OPEN: &str = "╣";
const DOMAIN_NAME_END: &str = ":";
const STAMP: &str = "«s:";
const DIRTY: &str = "«d:";
const DOMAIN_CLOSE: &str = "║";

#[derive(thiserror::Error, Debug)]
pub enum CookieDecodeError {
    #[error("expected {expected:?} at byte {position}")]
    Grammar {
        expected: &'static str,
        position: usize,
    },
    #[error("unexpected trailing input at byte {0}")]
    TrailingInput(usize),
    #[error("invalid {domain} dirty features: {source}")]
    Json {
        domain: Domain,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} dirty features are not a JSON object")]
    NotAnObject(Domain),
    #[error("cookie belongs to another user")]
    UserMismatch,
}

/// Result of [`decode`]. When `invalidate` is set the stored cookie is unusable and
/// should be cleared unless a fresh one replaces it.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    pub state: CookieState,
    pub invalidate: bool,
}

/// Fields of a structurally valid cookie, before the identity check.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedCookie {
    pub user_id: String,
    pub bucket: Option<String>,
    pub stamps: PerDomain<Option<Stamp>>,
    pub dirty: PerDomain<Features>,
}

impl ParsedCookie {
    /// Turns the parsed fields into stored experiments for `expected_user`.
    pub fn into_state(self, expected_user: &str) -> Result<CookieState, CookieDecodeError> {
        if self.user_id != expected_user {
            return Err(CookieDecodeError::UserMismatch);
        }

        let ParsedCookie {
            user_id,
            bucket,
            mut stamps,
            dirty,
        } = self;

        let snapshots = dirty.map(|domain, features| FeatureSnapshot {
            user_id: user_id.clone(),
            bucket: bucket.clone(),
            stamp: stamps.get_mut(domain).take(),
            dirty_features: features.keys().cloned().collect(),
            features,
        });

        Ok(CookieState {
            user_id,
            experiments: Some(StoredExperiments { bucket, snapshots }),
        })
    }
}

/// Decodes the raw cookie for the user identified by `default_user_id`.
///
/// Never fails: a missing cookie yields a fresh state, a malformed cookie or one
/// written for somebody else yields a fresh state with `invalidate` set.
pub fn decode(raw: Option<&str>, default_user_id: &str) -> Decoded {
    let Some(raw) = raw.filter(|raw| !raw.is_empty()) else {
        counter!(COOKIE_DECODE, "outcome" => "missing").increment(1);
        return Decoded {
            state: CookieState::new_user(default_user_id),
            invalidate: false,
        };
    };

    match parse(raw).and_then(|parsed| parsed.into_state(default_user_id)) {
        Ok(state) => {
            counter!(COOKIE_DECODE, "outcome" => "ok").increment(1);
            Decoded {
                state,
                invalidate: false,
            }
        }
        Err(err) => {
            let outcome = match &err {
                CookieDecodeError::UserMismatch => "new_user",
                _ => "invalid",
            };
            counter!(COOKIE_DECODE, "outcome" => outcome).increment(1);
            tracing::debug!(error = %err, "discarding experiments cookie");
            Decoded {
                state: CookieState::new_user(default_user_id),
                invalidate: true,
            }
        }
    }
}

/// Strict parse of the whole input against the cookie grammar.
pub fn parse(raw: &str) -> Result<ParsedCookie, CookieDecodeError> {
    let mut scanner = Scanner::new(raw);

    scanner.expect(USER)?;
    let user_id = scanner.take_until("«").to_string();
    scanner.expect(BUCKET)?;
    let bucket = non_empty(scanner.take_until(DOMAIN_OPEN));

    let (app_stamp, app_dirty) = parse_domain(&mut scanner, Domain::App)?;
    let (shared_stamp, shared_dirty) = parse_domain(&mut scanner, Domain::Shared)?;
    scanner.finish()?;

    Ok(ParsedCookie {
        user_id,
        bucket,
        stamps: PerDomain::new(app_stamp, shared_stamp),
        dirty: PerDomain::new(app_dirty, shared_dirty),
    })
}

fn parse_domain(
    scanner: &mut Scanner<'_>,
    domain: Domain,
) -> Result<(Option<Stamp>, Features), CookieDecodeError> {
    scanner.expect(DOMAIN_OPEN)?;
    scanner.expect(domain.as_str())?;
    scanner.expect(DOMAIN_NAME_END)?;
    scanner.expect(STAMP)?;
    let stamp = non_empty(scanner.take_until("«"));
    scanner.expect(DIRTY)?;
    let json = scanner.take_until(DOMAIN_CLOSE);
    scanner.expect(DOMAIN_CLOSE)?;

    let value: Value = serde_json::from_str(json)
        .map_err(|source| CookieDecodeError::Json { domain, source })?;

    match value {
        Value::Object(features) => Ok((stamp, features)),
        _ => Err(CookieDecodeError::NotAnObject(domain)),
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Encodes the experiments of `user_id`. The header bucket is the app snapshot's bucket.
pub fn encode_experiments(user_id: &str, snapshots: &PerDomain<FeatureSnapshot>) -> String {
    let mut out = String::with_capacity(64);
    out.push_str(USER);
    out.push_str(user_id);
    out.push_str(BUCKET);
    out.push_str(snapshots.app.bucket.as_deref().unwrap_or_default());

    for domain in Domain::ALL {
        encode_domain(&mut out, domain, snapshots.get(domain));
    }

    out
}

/// Encodes a cookie state; `None` when there is nothing stored to persist.
pub fn encode(state: &CookieState) -> Option<String> {
    state
        .experiments
        .as_ref()
        .map(|experiments| encode_experiments(&state.user_id, &experiments.snapshots))
}

fn encode_domain(out: &mut String, domain: Domain, snapshot: &FeatureSnapshot) {
    out.push_str(DOMAIN_OPEN);
    out.push_str(domain.as_str());
    out.push_str(DOMAIN_NAME_END);
    out.push_str(STAMP);
    out.push_str(snapshot.stamp.as_deref().unwrap_or_default());
    out.push_str(DIRTY);
    let json = Value::Object(snapshot.dirty_values()).to_string();
    push_escaped_json(out, &json);
    out.push_str(DOMAIN_CLOSE);
}

/// Delimiters can only occur inside JSON strings, where a `\uXXXX` escape reads back
/// as the same character.
fn push_escaped_json(out: &mut String, json: &str) {
    for c in json.chars() {
        match c {
            '║' | '╣' | '«' => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Scanner { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn expect(&mut self, token: &'static str) -> Result<(), CookieDecodeError> {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(CookieDecodeError::Grammar {
                expected: token,
                position: self.pos,
            })
        }
    }

    /// Consumes everything before the next `stop`, or the rest of the input.
    fn take_until(&mut self, stop: &str) -> &'a str {
        let rest = self.rest();
        let len = rest.find(stop).unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn finish(self) -> Result<(), CookieDecodeError> {
        if self.pos == self.input.len() {
            Ok(())
        } else {
            Err(CookieDecodeError::TrailingInput(self.pos))
        }
    }
}
