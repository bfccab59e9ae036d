//!  (A)utomatic (P)ersisted (Q)ueries negotiation.
//!
//!  The document is replaced by its hash. When the server does not know the hash, the request
//!  is sent again with the document; when it does not support persisted queries at all, they
//!  are disabled for the rest of the pipeline's life.
//!
//!  For more information on APQ see:
//!  <https://www.apollographql.com/docs/apollo-server/performance/apq/>

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::task::Poll;

use futures::future::BoxFuture;
use sha2::Digest;
use sha2::Sha256;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;

use super::FetchError;
use super::Request;
use super::Response;
use crate::graphql;

const PERSISTED_QUERY_NOT_FOUND_EXTENSION_CODE: &str = "PERSISTED_QUERY_NOT_FOUND";
const PERSISTED_QUERY_NOT_SUPPORTED_EXTENSION_CODE: &str = "PERSISTED_QUERY_NOT_SUPPORTED";
const PERSISTED_QUERY_NOT_FOUND_MESSAGE: &str = "PersistedQueryNotFound";
const PERSISTED_QUERY_NOT_SUPPORTED_MESSAGE: &str = "PersistedQueryNotSupported";
const CODE_STRING: &str = "code";
const PERSISTED_QUERY_KEY: &str = "persistedQuery";
const HASH_VERSION_KEY: &str = "version";
const HASH_VERSION_VALUE: i32 = 1;
const HASH_KEY: &str = "sha256Hash";

enum APQError {
    PersistedQueryNotSupported,
    PersistedQueryNotFound,
    Other,
}

fn get_apq_error(gql_response: &graphql::Response) -> APQError {
    for error in &gql_response.errors {
        match error.message.as_str() {
            PERSISTED_QUERY_NOT_FOUND_MESSAGE => {
                return APQError::PersistedQueryNotFound;
            }
            PERSISTED_QUERY_NOT_SUPPORTED_MESSAGE => {
                return APQError::PersistedQueryNotSupported;
            }
            _ => {}
        }
        if let Some(value) = error.extensions.get(CODE_STRING) {
            if value == PERSISTED_QUERY_NOT_FOUND_EXTENSION_CODE {
                return APQError::PersistedQueryNotFound;
            } else if value == PERSISTED_QUERY_NOT_SUPPORTED_EXTENSION_CODE {
                return APQError::PersistedQueryNotSupported;
            }
        }
    }
    APQError::Other
}

/// The persisted query hash of a document.
pub fn calculate_hash_for_query(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

/// [`Layer`] negotiating persisted queries with the server.
#[derive(Clone, Debug)]
pub struct PersistedQueryLayer {
    enabled: Arc<AtomicBool>,
}

impl PersistedQueryLayer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    /// Whether requests are still sent as hashes.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Relaxed)
    }
}

impl<S> Layer<S> for PersistedQueryLayer {
    type Service = PersistedQueryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PersistedQueryService {
            inner,
            enabled: self.enabled.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PersistedQueryService<S> {
    inner: S,
    enabled: Arc<AtomicBool>,
}

impl<S> Service<Request> for PersistedQueryService<S>
where
    S: Service<Request, Response = Response, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let enabled = self.enabled.clone();

        Box::pin(async move {
            request.context.check()?;
            // If APQ is not enabled, simply make the call with the same request body.
            if !enabled.load(Relaxed) {
                return inner.ready().await?.call(request).await;
            }

            let query = request.body.query.clone().ok_or_else(|| {
                FetchError::PersistedQuery {
                    reason: format!(
                        "operation '{}' has no document to hash",
                        request.operation.name()
                    ),
                }
            })?;
            let persisted_query = serde_json_bytes::json!({
                HASH_VERSION_KEY: HASH_VERSION_VALUE,
                HASH_KEY: calculate_hash_for_query(&query)
            });

            let mut apq_request = request.clone();
            apq_request
                .body
                .extensions
                .insert(PERSISTED_QUERY_KEY, persisted_query);
            apq_request.body.query = None;

            let response = inner.ready().await?.call(apq_request.clone()).await?;

            match get_apq_error(&response.response) {
                APQError::PersistedQueryNotSupported => {
                    tracing::debug!("apq: not supported by the server, disabling it");
                    enabled.store(false, Relaxed);
                    request.context.check()?;
                    inner.ready().await?.call(request).await
                }
                APQError::PersistedQueryNotFound => {
                    tracing::trace!("apq: cache miss, sending the document");
                    request.context.check()?;
                    apq_request.body.query = Some(query);
                    inner.ready().await?.call(apq_request).await
                }
                APQError::Other => {
                    tracing::trace!("apq: cache hit");
                    Ok(response)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::operation::Operation;
    use crate::pipeline::NetworkService;
    use crate::pipeline::tests::MockTransport;
    use crate::pipeline::tests::hero_query;
    use crate::pipeline::tests::hero_response;

    fn not_found() -> graphql::Response {
        graphql::Response::builder()
            .error(
                graphql::Error::builder()
                    .message(PERSISTED_QUERY_NOT_FOUND_MESSAGE)
                    .build(),
            )
            .build()
    }

    fn not_supported() -> graphql::Response {
        graphql::Response::builder()
            .error(
                graphql::Error::builder()
                    .message("unsupported")
                    .extension_code(PERSISTED_QUERY_NOT_SUPPORTED_EXTENSION_CODE)
                    .build(),
            )
            .build()
    }

    fn request() -> Request {
        Request::builder().operation(hero_query()).build()
    }

    #[test]
    fn hashes_are_hex_sha256() {
        let hash = calculate_hash_for_query("query Hero { hero { id name } }");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hero_query().operation_id());
    }

    #[tokio::test]
    async fn sends_the_hash_only_when_known() {
        let transport = MockTransport::new(vec![Ok(hero_response("Luke"))]);
        let layer = PersistedQueryLayer::new(true);
        let response = layer
            .layer(NetworkService::new(transport.clone()))
            .oneshot(request())
            .await
            .unwrap();
        assert_eq!(response.response, hero_response("Luke"));

        let sent = transport.requests.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].query, None);
        assert_eq!(
            sent[0].extensions.get(PERSISTED_QUERY_KEY),
            Some(&json!({
                "version": 1,
                "sha256Hash": calculate_hash_for_query("query Hero { hero { id name } }")
            }))
        );
    }

    #[tokio::test]
    async fn resends_the_document_when_the_hash_is_unknown() {
        let transport = MockTransport::new(vec![Ok(not_found()), Ok(hero_response("Luke"))]);
        let layer = PersistedQueryLayer::new(true);
        let response = layer
            .layer(NetworkService::new(transport.clone()))
            .oneshot(request())
            .await
            .unwrap();
        assert_eq!(response.response, hero_response("Luke"));
        assert!(layer.is_enabled());

        let sent = transport.requests.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].query.as_deref(), Some("query Hero { hero { id name } }"));
        assert!(sent[1].extensions.contains_key(PERSISTED_QUERY_KEY));
    }

    #[tokio::test]
    async fn a_second_rejection_is_returned_as_is() {
        let transport = MockTransport::new(vec![Ok(not_found()), Ok(not_found())]);
        let response = PersistedQueryLayer::new(true)
            .layer(NetworkService::new(transport.clone()))
            .oneshot(request())
            .await
            .unwrap();
        assert_eq!(response.response, not_found());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsupported_servers_disable_persisted_queries() {
        let transport = MockTransport::new(vec![
            Ok(not_supported()),
            Ok(hero_response("Luke")),
            Ok(hero_response("Leia")),
        ]);
        let layer = PersistedQueryLayer::new(true);
        let service = layer.layer(NetworkService::new(transport.clone()));

        let response = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.response, hero_response("Luke"));
        assert!(!layer.is_enabled());

        // later requests carry the document right away
        service.oneshot(request()).await.unwrap();
        let sent = transport.requests.lock();
        assert_eq!(sent.len(), 3);
        assert!(!sent[1].extensions.contains_key(PERSISTED_QUERY_KEY));
        assert!(!sent[2].extensions.contains_key(PERSISTED_QUERY_KEY));
        assert!(sent[2].query.is_some());
    }

    #[tokio::test]
    async fn disabled_layers_pass_requests_through() {
        let transport = MockTransport::new(vec![Ok(hero_response("Luke"))]);
        PersistedQueryLayer::new(false)
            .layer(NetworkService::new(transport.clone()))
            .oneshot(request())
            .await
            .unwrap();
        let sent = transport.requests.lock();
        assert!(sent[0].extensions.is_empty());
        assert!(sent[0].query.is_some());
    }
}
