//! Transport Abstraction
//!
//! Capability traits over the platform BLE stack. The session layer never
//! talks to the OS directly; it goes through [`Transport`] so the link
//! logic stays portable and testable. The Windows runtime backend lives in
//! [`super::winrt`]; tests script an in-memory implementation.

use crate::domain::models::DeviceHandle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Failures at the platform boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bluetooth access denied: {0}")]
    PermissionDenied(String),
    #[error("device request dismissed")]
    UserCancelled,
    #[error("GATT connect failed: {0}")]
    Connect(String),
    #[error("service or characteristic not found: {0}")]
    NotFound(String),
    #[error("characteristic write failed: {0}")]
    Write(String),
    #[error("notify subscription failed: {0}")]
    Subscribe(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Value delivered by a notify subscription.
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    /// A characteristic value pushed by the peripheral.
    Value(Vec<u8>),
    /// The link dropped; no further values will arrive.
    Disconnected,
}

/// Sticky cancellation flag shared between an operation's owner and the
/// task suspended on it. Cancelling wakes every waiter; a token observed
/// cancelled stays cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelShared>,
}

#[derive(Default)]
struct CancelShared {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        // Flag first: a waiter registered after this still re-checks it.
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Suspend until the token is cancelled. A cancel that lands between
    /// registering the waiter and checking the flag is never lost.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Active notify subscription. Exits from the connected state call
/// [`NotifySubscription::unsubscribe`]; dropping the value detaches the
/// handler as well, so the platform resource never outlives its owner.
pub struct NotifySubscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl NotifySubscription {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for NotifySubscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Platform capability set required by the link layer. All suspending
/// operations are cancel-safe: dropping the future or firing the passed
/// token must release the underlying platform resource.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Devices the platform has already authorized for this application.
    /// May be empty; must not block indefinitely.
    async fn authorized_devices(&self) -> Result<Vec<DeviceHandle>, TransportError>;

    /// Prompt the operator to pick a peripheral advertising the rig
    /// service. `UserCancelled` when the prompt is dismissed.
    async fn request_device(&self) -> Result<DeviceHandle, TransportError>;

    /// Suspend until `device` is seen advertising, or until `cancel`
    /// fires (`Err(Cancelled)`).
    async fn watch_advertisements(
        &self,
        device: &DeviceHandle,
        cancel: &CancelToken,
    ) -> Result<(), TransportError>;

    /// Open a GATT link to `device`.
    async fn connect(&self, device: &DeviceHandle) -> Result<Box<dyn GattLink>, TransportError>;
}

/// An open GATT connection.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Resolve the service/characteristic pair used as the command
    /// channel.
    async fn resolve_characteristic(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<Arc<dyn Characteristic>, TransportError>;

    /// Close the underlying connection. Idempotent.
    fn close(&self);
}

/// The single write/notify endpoint of a connected rig.
#[async_trait]
pub trait Characteristic: Send + Sync {
    /// Write one command frame.
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to value notifications. Values and the remote-disconnect
    /// signal arrive on `sink`.
    async fn subscribe(
        &self,
        sink: mpsc::UnboundedSender<NotifyEvent>,
    ) -> Result<NotifySubscription, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_before_wait_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        // Completes without any other task running.
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_detaches_once() {
        use std::sync::atomic::AtomicUsize;
        let count = Arc::new(AtomicUsize::new(0));
        let subscription = {
            let count = Arc::clone(&count);
            NotifySubscription::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        subscription.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
