//! The terminal stage: hands requests to a transport.

use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tower::BoxError;
use tower::Service;
use tracing::Instrument;

use super::FetchError;
use super::Request;
use super::Response;
use super::ResponseSource;
use crate::graphql;

/// Sends GraphQL requests to a server.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    async fn send(&self, request: graphql::Request) -> Result<graphql::Response, BoxError>;
}

#[async_trait]
impl<T> NetworkTransport for Arc<T>
where
    T: NetworkTransport + ?Sized,
{
    async fn send(&self, request: graphql::Request) -> Result<graphql::Response, BoxError> {
        (**self).send(request).await
    }
}

/// A [`Service`] over a [`NetworkTransport`].
pub struct NetworkService<T> {
    transport: Arc<T>,
}

impl<T> Clone for NetworkService<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T> std::fmt::Debug for NetworkService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkService").finish()
    }
}

impl<T: NetworkTransport> NetworkService<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }
}

impl<T: NetworkTransport> Service<Request> for NetworkService<T> {
    type Response = Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let transport = self.transport.clone();
        let operation = request.operation.name().to_string();
        let span = tracing::info_span!("network_request", "graphql.operation.name" = %operation);
        Box::pin(
            async move {
                request.context.check()?;
                tracing::trace!("network: sending '{operation}'");
                let response = transport.send(request.body).await.map_err(|e| {
                    FetchError::Network {
                        operation,
                        reason: e.to_string(),
                    }
                })?;
                Ok(Response::new(
                    response,
                    ResponseSource::Network,
                    request.context,
                ))
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use super::*;
    use crate::pipeline::tests::MockTransport;
    use crate::pipeline::tests::hero_query;
    use crate::pipeline::tests::hero_response;

    #[tokio::test]
    async fn sends_the_request_body() {
        let transport = MockTransport::new(vec![Ok(hero_response("Luke"))]);
        let response = NetworkService::new(transport.clone())
            .oneshot(Request::builder().operation(hero_query()).build())
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.response, hero_response("Luke"));

        let sent = transport.requests.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].query.as_deref(), Some("query Hero { hero { id name } }"));
        assert_eq!(sent[0].operation_name.as_deref(), Some("Hero"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failures_are_network_errors() {
        let transport = MockTransport::new(vec![Err("connection reset".to_string())]);
        let error = NetworkService::new(transport)
            .oneshot(Request::builder().operation(hero_query()).build())
            .await
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "network request for operation 'Hero' failed: connection reset"
        );
    }
}
