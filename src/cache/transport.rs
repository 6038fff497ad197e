//! Signal-extracting transport decorator.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use super::manager::InvalidationManager;

/// A response that may carry an invalidation signal in its headers.
pub trait SignalCarrier {
    fn signal_headers(&self) -> &HeaderMap;
}

impl SignalCarrier for reqwest::Response {
    fn signal_headers(&self) -> &HeaderMap {
        self.headers()
    }
}

impl SignalCarrier for HeaderMap {
    fn signal_headers(&self) -> &HeaderMap {
        self
    }
}

/// One network round trip.
#[async_trait]
pub trait Transport: Send + Sync {
    type Request: Send + 'static;
    type Response: SignalCarrier + Send;
    type Error: Send;

    async fn send(&self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

/// Wraps a transport so every response is scanned for a signal.
///
/// Responses and errors pass through untouched; a decoded signal is
/// dispatched to the manager before the response is handed back.
pub struct SignalingTransport<T> {
    inner: T,
    manager: Arc<InvalidationManager>,
}

impl<T> SignalingTransport<T> {
    pub fn new(inner: T, manager: Arc<InvalidationManager>) -> Self {
        Self { inner, manager }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn manager(&self) -> &Arc<InvalidationManager> {
        &self.manager
    }
}

#[async_trait]
impl<T: Transport> Transport for SignalingTransport<T> {
    type Request = T::Request;
    type Response = T::Response;
    type Error = T::Error;

    async fn send(&self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        let response = self.inner.send(request).await?;
        self.manager.dispatch_signal(response.signal_headers());
        Ok(response)
    }
}
