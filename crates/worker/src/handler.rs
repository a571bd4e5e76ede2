//! Application handler abstraction.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Handler in function form.
pub type HandlerFn =
    Arc<dyn Fn(Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>>> + Send + Sync>;

/// Handler in object form.
#[async_trait]
pub trait AppService: Send + Sync {
    /// Handle one fully-buffered request
    async fn fetch(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// A loaded application handler.
///
/// The shape is decided once at load time; [`Handler::invoke`] hides it from
/// the request path.
#[derive(Clone)]
pub enum Handler {
    Function(HandlerFn),
    Service(Arc<dyn AppService>),
}

impl Handler {
    /// Wrap an async function.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Bytes>>> + Send + 'static,
    {
        Handler::Function(Arc::new(move |request| Box::pin(f(request))))
    }

    /// Wrap a service object.
    pub fn service(service: impl AppService + 'static) -> Self {
        Handler::Service(Arc::new(service))
    }

    /// Run the handler on one request.
    pub async fn invoke(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        match self {
            Handler::Function(f) => f(request).await,
            Handler::Service(service) => service.fetch(request).await,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Function(_) => f.write_str("Handler::Function"),
            Handler::Service(_) => f.write_str("Handler::Service"),
        }
    }
}

/// Source of the current handler.
///
/// Reloading strategies live behind this trait so the server only ever asks
/// for "the handler now".
pub trait HandlerProvider: Send + Sync {
    /// Current handler, loading it if needed
    fn get(&self) -> Result<Handler>;

    /// Drop the cached handler; the next `get` loads again
    fn invalidate(&self);

    /// Whether a handler is currently loaded
    fn is_loaded(&self) -> bool;

    /// Reload if the backing source changed. Returns true when it reloaded.
    fn refresh(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Provider holding a single handler for the life of the worker.
pub struct FixedProvider {
    handler: Handler,
}

impl FixedProvider {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }
}

impl HandlerProvider for FixedProvider {
    fn get(&self) -> Result<Handler> {
        Ok(self.handler.clone())
    }

    fn invalidate(&self) {}

    fn is_loaded(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;

    struct Echo;

    #[async_trait]
    impl AppService for Echo {
        async fn fetch(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
            Ok(Response::new(request.into_body()))
        }
    }

    #[tokio::test]
    async fn test_function_handler() {
        let handler = Handler::from_fn(|request: Request<Bytes>| async move {
            Ok(Response::new(Bytes::from(format!("path={}", request.uri().path()))))
        });

        let response = handler
            .invoke(Request::get("/hello").body(Bytes::new()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.body(), &Bytes::from("path=/hello"));
    }

    #[tokio::test]
    async fn test_service_handler() {
        let handler = Handler::service(Echo);
        let response = handler
            .invoke(Request::post("/").body(Bytes::from("ping")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.body(), &Bytes::from("ping"));
        assert_eq!(format!("{:?}", handler), "Handler::Service");
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let handler =
            Handler::from_fn(|_request| async move { Err(WorkerError::handler("boom")) });
        let result = handler
            .invoke(Request::get("/").body(Bytes::new()).unwrap())
            .await;
        assert!(matches!(result, Err(WorkerError::Handler(_))));
    }

    #[test]
    fn test_fixed_provider_is_always_loaded() {
        let provider = FixedProvider::new(Handler::service(Echo));
        assert!(provider.is_loaded());
        provider.invalidate();
        assert!(provider.is_loaded());
        assert!(!provider.refresh().unwrap());
        assert!(provider.get().is_ok());
    }
}
