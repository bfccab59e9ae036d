//! The request pipeline in front of the store.
//!
//! Each stage is a tower [`Layer`](tower::Layer): the fetch policy stage answers from the cache
//! or forwards, the normalize stage writes network responses into the store, the persisted
//! query stage negotiates hashed documents with the server, and the [`NetworkService`] hands
//! the request to a [`NetworkTransport`].

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use displaydoc::Display;
use serde::Serialize;
use serde_json_bytes::Value;
use thiserror::Error;
use tower::BoxError;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::util::BoxCloneService;

use crate::cache::CacheHeaders;
use crate::configuration::Configuration;
use crate::graphql;
use crate::operation::Operation;
use crate::store::ApolloStore;

pub mod fetch_policy;
pub mod network;
pub mod normalize;
pub mod persisted_queries;

pub use self::fetch_policy::FetchPolicy;
pub use self::fetch_policy::FetchPolicyLayer;
pub use self::network::NetworkService;
pub use self::network::NetworkTransport;
pub use self::normalize::NormalizeLayer;
pub use self::persisted_queries::PersistedQueryLayer;

/// A type-erased pipeline.
pub type PipelineService = BoxCloneService<Request, Response, BoxError>;

/// State shared by every stage handling one request.
#[derive(Clone, Debug, Default)]
pub struct Context {
    canceled: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the request. Stages not yet entered fail with [`FetchError::Canceled`].
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), FetchError> {
        if self.is_canceled() {
            Err(FetchError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// A request travelling down the pipeline.
#[derive(Clone)]
#[non_exhaustive]
pub struct Request {
    pub operation: Arc<dyn Operation>,

    /// What is sent over the network.
    pub body: graphql::Request,

    /// Overrides the pipeline's default fetch policy.
    pub fetch_policy: Option<FetchPolicy>,

    pub cache_headers: CacheHeaders,

    pub context: Context,
}

#[buildstructor::buildstructor]
impl Request {
    #[builder(visibility = "pub")]
    fn new(
        operation: Arc<dyn Operation>,
        fetch_policy: Option<FetchPolicy>,
        cache_headers: Option<CacheHeaders>,
        context: Option<Context>,
    ) -> Self {
        Self {
            body: graphql::Request::from_operation(operation.as_ref()),
            operation,
            fetch_policy,
            cache_headers: cache_headers.unwrap_or_default(),
            context: context.unwrap_or_default(),
        }
    }
}

/// Where a [`Response`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// A response travelling back up the pipeline.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Response {
    pub response: graphql::Response,
    pub source: ResponseSource,
    pub context: Context,
}

impl Response {
    pub(crate) fn new(
        response: graphql::Response,
        source: ResponseSource,
        context: Context,
    ) -> Self {
        Self {
            response,
            source,
            context,
        }
    }
}

/// Pipeline failures.
#[derive(Error, Display, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
#[non_exhaustive]
pub enum FetchError {
    /// no cached data for operation '{operation}'
    CacheMiss {
        /// The operation name.
        operation: String,
    },

    /// cached data for operation '{operation}' is unusable: {reason}
    CacheRead {
        /// The operation name.
        operation: String,
        /// The read failure.
        reason: String,
    },

    /// network request for operation '{operation}' failed: {reason}
    Network {
        /// The operation name.
        operation: String,
        /// The transport failure.
        reason: String,
    },

    /// persisted query negotiation failed: {reason}
    PersistedQuery {
        /// What went wrong.
        reason: String,
    },

    /// request was canceled
    Canceled,
}

impl FetchError {
    pub fn extension_code(&self) -> &'static str {
        match self {
            FetchError::CacheMiss { .. } => "CACHE_MISS",
            FetchError::CacheRead { .. } => "CACHE_READ_ERROR",
            FetchError::Network { .. } => "NETWORK_ERROR",
            FetchError::PersistedQuery { .. } => "PERSISTED_QUERY_ERROR",
            FetchError::Canceled => "REQUEST_CANCELED",
        }
    }

    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self) -> graphql::Error {
        let extensions = match serde_json_bytes::to_value(self) {
            Ok(Value::Object(extensions)) => extensions,
            _ => Default::default(),
        };
        graphql::Error::builder()
            .message(self.to_string())
            .extension_code(self.extension_code())
            .extensions(extensions)
            .build()
    }
}

/// Assembles the full pipeline over `transport`.
pub fn pipeline<T>(
    store: ApolloStore,
    configuration: &Configuration,
    transport: T,
) -> PipelineService
where
    T: NetworkTransport,
{
    ServiceBuilder::new()
        .layer(FetchPolicyLayer::new(
            store.clone(),
            configuration.fetch_policy,
        ))
        .layer(NormalizeLayer::new(store))
        .layer(PersistedQueryLayer::new(
            configuration.persisted_queries.enabled,
        ))
        .service(NetworkService::new(transport))
        .boxed_clone()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::cache::memory::LruNormalizedCache;
    use crate::normalizer::tests::IdResolver;
    use crate::operation::GraphQLOperation;
    use crate::operation::ResponseField;
    use crate::store::dispatcher::InlineDispatcher;

    /// Answers every request with the next canned response and records what it was sent.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub(crate) responses: Mutex<Vec<Result<graphql::Response, String>>>,
        pub(crate) requests: Mutex<Vec<graphql::Request>>,
        pub(crate) calls: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn new(responses: Vec<Result<graphql::Response, String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl NetworkTransport for MockTransport {
        async fn send(&self, request: graphql::Request) -> Result<graphql::Response, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);
            match self.responses.lock().pop() {
                Some(Ok(response)) => Ok(response),
                Some(Err(reason)) => Err(reason.into()),
                None => Err("no more responses".into()),
            }
        }
    }

    pub(crate) fn hero_query() -> Arc<dyn Operation> {
        Arc::new(
            GraphQLOperation::builder()
                .name("Hero")
                .document("query Hero { hero { id name } }")
                .selections(vec![ResponseField::object(
                    "hero",
                    vec![ResponseField::scalar("id"), ResponseField::scalar("name")],
                )])
                .build(),
        )
    }

    pub(crate) fn hero_response(name: &str) -> graphql::Response {
        graphql::Response::builder()
            .data(json!({"hero": {"id": "1000", "name": name}}))
            .build()
    }

    pub(crate) fn store() -> ApolloStore {
        ApolloStore::builder(Arc::new(LruNormalizedCache::default()))
            .resolver(Arc::new(IdResolver))
            .dispatcher(Arc::new(InlineDispatcher))
            .build()
    }

    #[tokio::test]
    async fn full_pipeline_caches_network_responses() {
        let store = store();
        let transport = MockTransport::new(vec![Ok(hero_response("Luke"))]);
        let configuration = Configuration::builder().persisted_queries(false).build();
        let service = pipeline(store.clone(), &configuration, transport.clone());

        let response = service
            .clone()
            .oneshot(Request::builder().operation(hero_query()).build())
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Network);

        let response = service
            .oneshot(Request::builder().operation(hero_query()).build())
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.response, hero_response("Luke"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn canceled_requests_never_reach_the_network() {
        let transport = MockTransport::new(vec![Ok(hero_response("Luke"))]);
        let service = pipeline(store(), &Configuration::default(), transport.clone());
        let context = Context::new();
        context.cancel();

        let error = service
            .oneshot(
                Request::builder()
                    .operation(hero_query())
                    .context(context)
                    .build(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<FetchError>(),
            Some(&FetchError::Canceled)
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fetch_errors_convert_to_graphql_errors() {
        let error = FetchError::Network {
            operation: "Hero".to_string(),
            reason: "connection refused".to_string(),
        }
        .to_graphql_error();
        insta::assert_json_snapshot!(error, @r###"
        {
          "message": "network request for operation 'Hero' failed: connection refused",
          "extensions": {
            "operation": "Hero",
            "reason": "connection refused",
            "code": "NETWORK_ERROR"
          }
        }
        "###);
    }
}
