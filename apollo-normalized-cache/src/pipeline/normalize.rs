//! The network/parse stage: writes successful network responses into the store.

use std::task::Poll;

use futures::future::BoxFuture;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;

use super::Request;
use super::Response;
use crate::cache::DO_NOT_STORE;
use crate::store::ApolloStore;

/// [`Layer`] normalizing network responses into the store and publishing the changes.
#[derive(Clone, Debug)]
pub struct NormalizeLayer {
    store: ApolloStore,
}

impl NormalizeLayer {
    pub fn new(store: ApolloStore) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for NormalizeLayer {
    type Service = NormalizeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        NormalizeService {
            inner,
            store: self.store.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NormalizeService<S> {
    inner: S,
    store: ApolloStore,
}

impl<S> Service<Request> for NormalizeService<S>
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

        Box::pin(async move {
            request.context.check()?;
            let operation = request.operation.clone();
            let do_not_store = request.cache_headers.has_header(DO_NOT_STORE);
            let response = inner.oneshot(request).await?;

            if do_not_store || !response.response.errors.is_empty() {
                return Ok(response);
            }
            let Some(data) = response.response.data_object().cloned() else {
                return Ok(response);
            };
            match store
                .write_and_publish(operation.clone(), data)
                .execute_async()
                .await
            {
                Ok(changed) => {
                    tracing::trace!(
                        "normalize: wrote '{}' to the store, changed: {changed}",
                        operation.name()
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "normalize: could not write '{}' to the store: {e}",
                        operation.name()
                    );
                }
            }
            Ok(response)
        })
    }
}
