use experiments::RequestFeatures;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use serde_json::json;
use shared::http::{BoxedBody, full_body, make_boxed_error_response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

/// Shows what the gateway resolved for the caller.
///
/// `GET /features` returns both domains' snapshots, `GET /features/<name>` the value
/// of one feature.
pub struct FeaturesHandler;

impl FeaturesHandler {
    fn respond(
        &self,
        method: &Method,
        path: &str,
        features: Option<&RequestFeatures>,
    ) -> Response<BoxedBody> {
        let Some(rest) = path.strip_prefix("/features") else {
            return make_boxed_error_response(StatusCode::NOT_FOUND);
        };
        if method != Method::GET {
            return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        let Some(features) = features else {
            tracing::error!("request reached the handler without resolved features");
            return make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let body = match rest.trim_end_matches('/') {
            "" => json!(features.features()),
            rest => match rest.strip_prefix('/') {
                Some(name) => json!({ "name": name, "value": features.feature(name) }),
                None => return make_boxed_error_response(StatusCode::NOT_FOUND),
            },
        };

        let mut response = Response::new(full_body(body.to_string()));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

impl Service<Request<Incoming>> for FeaturesHandler {
    type Response = Response<BoxedBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(
            req.method(),
            req.uri().path(),
            req.extensions().get::<RequestFeatures>(),
        );
        Box::pin(async move { Ok(res) })
    }
}
