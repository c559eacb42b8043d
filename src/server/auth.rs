use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Requires `x-api-key` on every route except `/health` when a key is
/// configured; passes everything through otherwise.
#[derive(Clone)]
pub struct AuthLayer {
    api_key: Option<Arc<SecretString>>,
}

impl AuthLayer {
    pub fn new(api_key: Option<Arc<SecretString>>) -> Self {
        Self { api_key }
    }
}

impl<S> tower::Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            api_key: self.api_key.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    api_key: Option<Arc<SecretString>>,
}

impl<S> tower::Service<Request> for AuthMiddleware<S>
where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);
        let api_key = self.api_key.clone();

        Box::pin(async move {
            let public = request.uri().path() == "/health";
            let authorized = match &api_key {
                Some(key) if !public => check_api_key(request.headers(), key),
                _ => true,
            };

            if !authorized {
                return Ok((StatusCode::UNAUTHORIZED, "Unauthorized").into_response());
            }
            inner.call(request).await
        })
    }
}

fn check_api_key(headers: &HeaderMap, expected: &SecretString) -> bool {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|given| given == expected.expose_secret())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_check_api_key() {
        let key = SecretString::from("s3cret".to_string());
        let mut headers = HeaderMap::new();
        assert!(!check_api_key(&headers, &key));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(!check_api_key(&headers, &key));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("s3cret"));
        assert!(check_api_key(&headers, &key));
    }
}
