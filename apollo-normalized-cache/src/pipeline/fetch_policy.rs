//! Fetch policies: whether a request is answered from the cache, the network, or both.

use std::task::Poll;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tracing::Instrument;

use super::FetchError;
use super::Request;
use super::Response;
use super::ResponseSource;
use crate::Value;
use crate::graphql;
use crate::store::ApolloStore;

/// How a request uses the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FetchPolicy {
    /// Answer from the cache, go to the network on a miss.
    #[default]
    CacheFirst,
    /// Answer from the cache only. A miss is an error.
    CacheOnly,
    /// Go to the network, fall back to the cache if the network fails.
    NetworkFirst,
    /// Go to the network only. The response is still written to the cache.
    NetworkOnly,
}

/// [`Layer`] applying a [`FetchPolicy`].
#[derive(Clone, Debug)]
pub struct FetchPolicyLayer {
    store: ApolloStore,
    default_policy: FetchPolicy,
}

impl FetchPolicyLayer {
    pub fn new(store: ApolloStore, default_policy: FetchPolicy) -> Self {
        Self {
            store,
            default_policy,
        }
    }
}

impl<S> Layer<S> for FetchPolicyLayer {
    type Service = FetchPolicyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FetchPolicyService {
            inner,
            store: self.store.clone(),
            default_policy: self.default_policy,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FetchPolicyService<S> {
    inner: S,
    store: ApolloStore,
    default_policy: FetchPolicy,
}

/// Reads the response to `request` from the store. `Ok(None)` is a miss.
async fn read_cache(
    store: &ApolloStore,
    request: &Request,
) -> Result<Option<Response>, FetchError> {
    let read = store.read_with_headers(request.operation.clone(), request.cache_headers.clone());
    match read.execute_async().await {
        Ok(Some(data)) => {
            tracing::trace!("fetch policy: cache hit for '{}'", request.operation.name());
            Ok(Some(Response::new(
                graphql::Response::builder()
                    .data(Value::Object(data))
                    .build(),
                ResponseSource::Cache,
                request.context.clone(),
            )))
        }
        Ok(None) => {
            tracing::trace!("fetch policy: cache miss for '{}'", request.operation.name());
            Ok(None)
        }
        Err(e) => Err(FetchError::CacheRead {
            operation: request.operation.name().to_string(),
            reason: e.to_string(),
        }),
    }
}

impl<S> Service<Request> for FetchPolicyService<S>
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
        let inner = std::mem::replace(&mut self.inner, clone);
        let store = self.store.clone();
        let policy = request.fetch_policy.unwrap_or(self.default_policy);
        let span = tracing::info_span!(
            "fetch",
            "graphql.operation.name" = %request.operation.name(),
            fetch_policy = ?policy
        );

        Box::pin(async move {
            request.context.check()?;
            match policy {
                FetchPolicy::CacheOnly => {
                    let operation = request.operation.name().to_string();
                    Ok(read_cache(&store, &request)
                        .await?
                        .ok_or(FetchError::CacheMiss { operation })?)
                }
                FetchPolicy::CacheFirst => match read_cache(&store, &request).await {
                    Ok(Some(response)) => Ok(response),
                    Ok(None) => inner.oneshot(request).await,
                    Err(e) => {
                        tracing::warn!("fetch policy: {e}, going to the network");
                        inner.oneshot(request).await
                    }
                },
                FetchPolicy::NetworkFirst => {
                    let fallback = request.clone();
                    match inner.oneshot(request).await {
                        Ok(response) => Ok(response),
                        Err(error) => {
                            tracing::debug!(
                                "fetch policy: network failed: {error}, trying the cache"
                            );
                            match read_cache(&store, &fallback).await {
                                Ok(Some(response)) => Ok(response),
                                _ => Err(error),
                            }
                        }
                    }
                }
                FetchPolicy::NetworkOnly => inner.oneshot(request).await,
            }
        }
        .instrument(span))
    }
}
