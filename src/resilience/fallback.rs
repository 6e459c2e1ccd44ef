//! Fallback handlers.
//!
//! A fallback turns a failed call into a degraded but successful result.
//! Handlers are registered per service and typed by the result they produce;
//! a handler whose types do not match the call is treated as absent.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use crate::observability::metrics;
use crate::resilience::error::ResilienceError;

/// Produces a substitute result for a failed call.
pub trait FallbackHandler<T, E>: Send + Sync {
    fn invoke(&self) -> BoxFuture<'static, Result<T, E>>;
}

impl<T, E, F, Fut> FallbackHandler<T, E> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    fn invoke(&self) -> BoxFuture<'static, Result<T, E>> {
        self().boxed()
    }
}

type DynHandler<T, E> = Arc<dyn FallbackHandler<T, E>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    pub invocations: u64,
    pub success: u64,
    pub failure: u64,
}

#[derive(Default)]
pub struct FallbackManager {
    handlers: DashMap<String, Arc<dyn Any + Send + Sync>>,
    stats: DashMap<String, FallbackStats>,
}

impl FallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `service`.
    pub fn register<T, E, H>(&self, service: &str, handler: H)
    where
        T: 'static,
        E: 'static,
        H: FallbackHandler<T, E> + 'static,
    {
        let handler: DynHandler<T, E> = Arc::new(handler);
        self.handlers.insert(service.to_string(), Arc::new(handler));
        tracing::info!(service = %service, "Fallback handler registered");
    }

    pub fn has_handler(&self, service: &str) -> bool {
        self.handlers.contains_key(service)
    }

    pub fn remove(&self, service: &str) -> bool {
        self.handlers.remove(service).is_some()
    }

    fn handler<T: 'static, E: 'static>(&self, service: &str) -> Option<DynHandler<T, E>> {
        let any = self.handlers.get(service)?.clone();
        let handler = any.downcast_ref::<DynHandler<T, E>>().cloned();
        if handler.is_none() {
            tracing::warn!(service = %service, "Fallback handler registered for a different result type");
        }
        handler
    }

    /// Recover from `error` with the service's handler.
    ///
    /// Without a usable handler the original error is returned. A failing
    /// handler surfaces its own error.
    pub async fn recover<T, E>(&self, service: &str, error: ResilienceError<E>) -> Result<T, ResilienceError<E>>
    where
        T: 'static,
        E: Display + 'static,
    {
        let Some(handler) = self.handler::<T, E>(service) else {
            return Err(error);
        };

        self.stats.entry(service.to_string()).or_default().invocations += 1;
        tracing::warn!(service = %service, error = %error, "Primary call failed, invoking fallback");

        match handler.invoke().await {
            Ok(value) => {
                self.stats.entry(service.to_string()).or_default().success += 1;
                metrics::record_fallback(service, true);
                Ok(value)
            }
            Err(e) => {
                self.stats.entry(service.to_string()).or_default().failure += 1;
                tracing::error!(service = %service, error = %e, "Fallback failed");
                metrics::record_fallback(service, false);
                Err(ResilienceError::Inner(e))
            }
        }
    }

    /// Run `primary`, falling back on any error.
    pub async fn execute<T, E, Fut>(&self, service: &str, primary: Fut) -> Result<T, ResilienceError<E>>
    where
        T: 'static,
        E: Display + 'static,
        Fut: Future<Output = Result<T, E>>,
    {
        match primary.await {
            Ok(value) => Ok(value),
            Err(e) => self.recover(service, ResilienceError::Inner(e)).await,
        }
    }

    pub fn stats(&self) -> BTreeMap<String, FallbackStats> {
        self.stats.iter().map(|s| (s.key().clone(), *s.value())).collect()
    }
}
