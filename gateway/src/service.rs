use crate::client::FeatureClient;
use crate::identity::Identify;
use crate::metrics_defs::RESOLVE_DURATION;
use crate::store::{CookieStore, CookieUpdate, ExperimentStore};
use http::{Request, Response};
use hyper::service::Service;
use shared::histogram;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Wraps a service so every request reaches it with
/// [`RequestFeatures`](experiments::RequestFeatures) in its extensions, and every
/// response carries the updated experiments.
#[derive(Clone)]
pub struct FeatureService<S> {
    inner: S,
    client: FeatureClient,
    identity: Arc<dyn Identify>,
    store: Arc<dyn ExperimentStore>,
}

impl<S> FeatureService<S> {
    /// Persists experiments in the client's cookie.
    pub fn new(inner: S, client: FeatureClient, identity: Arc<dyn Identify>) -> Self {
        let store = Arc::new(CookieStore::new(client.cookie_name()));
        Self::with_store(inner, client, identity, store)
    }

    pub fn with_store(
        inner: S,
        client: FeatureClient,
        identity: Arc<dyn Identify>,
        store: Arc<dyn ExperimentStore>,
    ) -> Self {
        FeatureService {
            inner,
            client,
            identity,
            store,
        }
    }

    /// Resolves features for `req` and stores them in its extensions. Returns the
    /// user id together with the update to persist.
    pub fn prepare<B>(&self, req: &mut Request<B>) -> (String, CookieUpdate) {
        let started = Instant::now();
        let user_id = self.identity.user_id(req.headers());

        let decoded = self.store.read(req.headers(), &user_id);
        let resolution = self
            .client
            .resolver()
            .resolve(decoded.state, req.uri().query());
        req.extensions_mut().insert(resolution.features);

        histogram!(RESOLVE_DURATION).record(started.elapsed().as_secs_f64());

        let update = match resolution.cookie {
            Some(cookie) => CookieUpdate::Set(cookie),
            // Only reachable with an empty user id, otherwise a fresh cookie replaces
            // the invalid one.
            None if decoded.invalidate => CookieUpdate::Clear,
            None => CookieUpdate::Unchanged,
        };
        (user_id, update)
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for FeatureService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, mut req: Request<ReqBody>) -> Self::Future {
        let (user_id, update) = self.prepare(&mut req);
        let store = self.store.clone();
        let future = self.inner.call(req);

        Box::pin(async move {
            let mut response = future.await?;
            store.write(&user_id, &update, response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeaturesConfig;
    use crate::cookies;
    use crate::identity::{AnonymousIdentity, HeaderIdentity};
    use crate::testutils::{ScriptedRemote, configured};
    use experiments::types::ANONYMOUS_USER;
    use experiments::codec::{self, Decoded};
    use experiments::{Domain, RequestFeatures, default_oracles};
    use http::header::{COOKIE, SET_COOKIE};
    use http::{HeaderMap, HeaderName, StatusCode};
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Mutex;

    async fn loaded_client() -> FeatureClient {
        let remote = Arc::new(ScriptedRemote::new(vec![Ok(configured(false))]));
        let client = FeatureClient::new(&FeaturesConfig::default(), remote, default_oracles());
        client.load().await.unwrap();
        client
    }

    async fn echo_dark_mode(
        req: Request<Empty<Bytes>>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let value = match req.extensions().get::<RequestFeatures>() {
            Some(features) => features.feature("dark_mode").to_string(),
            None => "missing".to_string(),
        };
        Ok(Response::new(Full::new(Bytes::from(value))))
    }

    fn request(uri: &str, cookie: Option<&str>, user: Option<&str>) -> Request<Empty<Bytes>> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, format!("xpr.config={cookie}"));
        }
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Empty::new()).unwrap()
    }

    fn set_cookie_value(response: &Response<Full<Bytes>>) -> Option<String> {
        response
            .headers()
            .get(SET_COOKIE)
            .map(|value| value.to_str().unwrap().to_string())
    }

    /// Raw cookie text from a `Set-Cookie` header written by the service.
    fn stored_cookie(set_cookie: &str) -> String {
        let value = set_cookie
            .strip_prefix("xpr.config=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        cookies::decode_transport(value).unwrap()
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_new_visitor_gets_cookie() {
        let service = FeatureService::new(
            service_fn(echo_dark_mode),
            loaded_client().await,
            Arc::new(AnonymousIdentity),
        );

        let response = service.call(request("/", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let set_cookie = set_cookie_value(&response).unwrap();
        assert!(set_cookie.contains("Max-Age=31536000"));
        assert!(set_cookie.contains("Path=/"));
        assert!(stored_cookie(&set_cookie).starts_with(&format!("u:{ANONYMOUS_USER}«b:")));
        assert_eq!(body(response).await, "false");
    }

    #[tokio::test]
    async fn test_override_is_remembered() {
        let service = FeatureService::new(
            service_fn(echo_dark_mode),
            loaded_client().await,
            Arc::new(AnonymousIdentity),
        );

        let first = service
            .call(request("/?xpr.dark_mode=true", None, None))
            .await
            .unwrap();
        let cookie = stored_cookie(&set_cookie_value(&first).unwrap());
        assert_eq!(body(first).await, "true");

        // no override this time, the cookie carries it
        let transport = cookies::encode_transport(&cookie);
        let second = service
            .call(request("/", Some(&transport), None))
            .await
            .unwrap();
        assert_eq!(stored_cookie(&set_cookie_value(&second).unwrap()), cookie);
        assert_eq!(body(second).await, "true");
    }

    #[tokio::test]
    async fn test_cookie_for_another_user_is_replaced() {
        let identity = HeaderIdentity::new(HeaderName::from_static("x-user-id"));
        let service = FeatureService::new(
            service_fn(echo_dark_mode),
            loaded_client().await,
            Arc::new(identity),
        );

        let first = service
            .call(request("/?xpr.dark_mode=true", None, Some("alice")))
            .await
            .unwrap();
        let transport = cookies::encode_transport(&stored_cookie(
            &set_cookie_value(&first).unwrap(),
        ));

        let second = service
            .call(request("/", Some(&transport), Some("bob")))
            .await
            .unwrap();
        let cookie = stored_cookie(&set_cookie_value(&second).unwrap());
        assert!(cookie.starts_with("u:bob«b:"));
        assert!(cookie.contains("«d:{}"));
        assert!(!cookie.contains("dark_mode\":true"));
        assert_eq!(body(second).await, "false");
    }

    #[tokio::test]
    async fn test_corrupt_cookie_is_replaced() {
        let service = FeatureService::new(
            service_fn(echo_dark_mode),
            loaded_client().await,
            Arc::new(AnonymousIdentity),
        );

        let truncated = cookies::encode_transport("u:__anon__«b:1╣app:");
        for cookie in ["%%%", truncated.as_str()] {
            let mut req = request("/", Some(cookie), None);
            let (_, update) = service.prepare(&mut req);

            let CookieUpdate::Set(raw) = update else {
                panic!("expected a fresh cookie, got {update:?}");
            };
            assert!(codec::parse(&raw).is_ok());

            let features = req.extensions().get::<RequestFeatures>().unwrap();
            assert!(features.snapshot(Domain::App).dirty_features.is_empty());
        }
    }

    struct EmptyIdentity;

    impl Identify for EmptyIdentity {
        fn identify(&self, _headers: &HeaderMap) -> Option<String> {
            Some(String::new())
        }
    }

    #[tokio::test]
    async fn test_empty_identity_clears_invalid_cookie() {
        let service = FeatureService::new(
            service_fn(echo_dark_mode),
            loaded_client().await,
            Arc::new(EmptyIdentity),
        );

        let mut req = request("/", Some("%%%"), None);
        assert_eq!(service.prepare(&mut req), (String::new(), CookieUpdate::Clear));

        let mut req = request("/?xpr.dark_mode=true", None, None);
        assert_eq!(service.prepare(&mut req).1, CookieUpdate::Unchanged);

        let response = service
            .call(request("/", Some("%%%"), None))
            .await
            .unwrap();
        assert!(set_cookie_value(&response).unwrap().contains("Max-Age=0"));
    }

    /// Keeps encoded experiments server side, keyed by user id.
    #[derive(Default)]
    struct MemoryStore {
        entries: Mutex<HashMap<String, String>>,
    }

    impl ExperimentStore for MemoryStore {
        fn read(&self, _headers: &HeaderMap, user_id: &str) -> Decoded {
            let entries = self.entries.lock().unwrap();
            codec::decode(entries.get(user_id).map(String::as_str), user_id)
        }

        fn write(&self, user_id: &str, update: &CookieUpdate, _headers: &mut HeaderMap) {
            let mut entries = self.entries.lock().unwrap();
            match update {
                CookieUpdate::Set(raw) => {
                    entries.insert(user_id.to_string(), raw.clone());
                }
                CookieUpdate::Clear => {
                    entries.remove(user_id);
                }
                CookieUpdate::Unchanged => {}
            }
        }
    }

    #[tokio::test]
    async fn test_custom_store() {
        let store = Arc::new(MemoryStore::default());
        let service = FeatureService::with_store(
            service_fn(echo_dark_mode),
            loaded_client().await,
            Arc::new(HeaderIdentity::new(HeaderName::from_static("x-user-id"))),
            store.clone(),
        );

        let first = service
            .call(request("/?xpr.dark_mode=true", None, Some("alice")))
            .await
            .unwrap();
        assert_eq!(set_cookie_value(&first), None);
        assert_eq!(body(first).await, "true");

        let stored = store.entries.lock().unwrap()["alice"].clone();
        assert!(stored.starts_with("u:alice«b:"));

        // remembered without any cookie, and only for alice
        let second = service
            .call(request("/", None, Some("alice")))
            .await
            .unwrap();
        assert_eq!(body(second).await, "true");

        let other = service.call(request("/", None, Some("bob"))).await.unwrap();
        assert_eq!(body(other).await, "false");
        assert_eq!(store.entries.lock().unwrap().len(), 2);
    }
}
