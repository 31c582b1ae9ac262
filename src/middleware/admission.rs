//! Admission control middleware
//!
//! Bounds how many uploads, downloads and listings may be in flight at once.
//! Each class has its own capacity; waiting callers are woken in FIFO order and
//! give up as soon as their cancellation token fires.

use std::fmt;
use std::sync::Arc;

use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Operation, ServiceError};

pub const DEFAULT_UPLOAD_LIMIT: usize = 10;
pub const DEFAULT_DOWNLOAD_LIMIT: usize = 10;
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Configured capacities; non-positive values fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub upload_limit: i64,
    pub download_limit: i64,
    pub list_limit: i64,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            upload_limit: DEFAULT_UPLOAD_LIMIT as i64,
            download_limit: DEFAULT_DOWNLOAD_LIMIT as i64,
            list_limit: DEFAULT_LIST_LIMIT as i64,
        }
    }
}

fn positive_or(value: i64, default: usize) -> usize {
    if value <= 0 {
        default
    } else {
        usize::try_from(value).unwrap_or(default).min(Semaphore::MAX_PERMITS)
    }
}

/// One unit of capacity for one operation class.
///
/// Capacity goes back to the controller when the permit is dropped, so every
/// early return releases it.
pub struct Permit {
    operation: Operation,
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("operation", &self.operation)
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        debug!("released {} permit", self.operation);
    }
}

/// Per-class concurrency limiter owned by a service instance.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    upload: Arc<Semaphore>,
    download: Arc<Semaphore>,
    list: Arc<Semaphore>,
    limits: (usize, usize, usize),
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        let upload = positive_or(limits.upload_limit, DEFAULT_UPLOAD_LIMIT);
        let download = positive_or(limits.download_limit, DEFAULT_DOWNLOAD_LIMIT);
        let list = positive_or(limits.list_limit, DEFAULT_LIST_LIMIT);

        Self {
            upload: Arc::new(Semaphore::new(upload)),
            download: Arc::new(Semaphore::new(download)),
            list: Arc::new(Semaphore::new(list)),
            limits: (upload, download, list),
        }
    }

    fn semaphore(&self, operation: Operation) -> &Arc<Semaphore> {
        match operation {
            Operation::Upload => &self.upload,
            Operation::Download => &self.download,
            Operation::List => &self.list,
        }
    }

    /// Effective capacity of a class after defaults were applied.
    pub fn limit(&self, operation: Operation) -> usize {
        match operation {
            Operation::Upload => self.limits.0,
            Operation::Download => self.limits.1,
            Operation::List => self.limits.2,
        }
    }

    /// Capacity currently free for a class.
    pub fn available(&self, operation: Operation) -> usize {
        self.semaphore(operation).available_permits()
    }

    /// Waits for a unit of capacity, or fails with `Canceled` once `cancel` fires.
    pub async fn acquire(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<Permit, ServiceError> {
        let semaphore = Arc::clone(self.semaphore(operation));

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{} admission wait canceled", operation);
                return Err(ServiceError::Canceled);
            }
            permit = semaphore.acquire_owned() => permit.map_err(|_| ServiceError::Canceled)?,
        };

        debug!(
            "acquired {} permit ({} of {} free)",
            operation,
            self.available(operation),
            self.limit(operation)
        );
        Ok(Permit {
            operation,
            _permit: permit,
        })
    }

    /// Returns a permit's capacity. Equivalent to dropping it.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn non_positive_limits_use_defaults() {
        let controller = AdmissionController::new(AdmissionLimits {
            upload_limit: 0,
            download_limit: -3,
            list_limit: 0,
        });
        assert_eq!(controller.limit(Operation::Upload), 10);
        assert_eq!(controller.limit(Operation::Download), 10);
        assert_eq!(controller.limit(Operation::List), 100);
    }

    #[test]
    fn positive_limits_are_kept() {
        let controller = AdmissionController::new(AdmissionLimits {
            upload_limit: 2,
            download_limit: 3,
            list_limit: 4,
        });
        assert_eq!(controller.available(Operation::Upload), 2);
        assert_eq!(controller.available(Operation::Download), 3);
        assert_eq!(controller.available(Operation::List), 4);
    }

    #[tokio::test]
    async fn classes_are_independent() {
        let controller = AdmissionController::new(AdmissionLimits {
            upload_limit: 1,
            download_limit: 1,
            list_limit: 1,
        });
        let cancel = CancellationToken::new();

        let _upload = controller.acquire(Operation::Upload, &cancel).await.unwrap();
        let download = tokio::time::timeout(
            Duration::from_millis(50),
            controller.acquire(Operation::Download, &cancel),
        )
        .await;
        assert!(download.is_ok(), "download capacity must not be used by uploads");
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let controller = AdmissionController::new(AdmissionLimits {
            upload_limit: 1,
            ..AdmissionLimits::default()
        });
        let cancel = CancellationToken::new();

        let first = controller.acquire(Operation::Upload, &cancel).await.unwrap();
        let waiting = tokio::time::timeout(
            Duration::from_millis(50),
            controller.acquire(Operation::Upload, &cancel),
        )
        .await;
        assert!(waiting.is_err(), "second acquire should block while the first is held");

        controller.release(first);
        let second = controller.acquire(Operation::Upload, &cancel).await.unwrap();
        assert_eq!(second.operation(), Operation::Upload);
        assert_eq!(controller.available(Operation::Upload), 0);
    }

    #[tokio::test]
    async fn canceled_wait_returns_canceled_and_leaks_nothing() {
        let controller = AdmissionController::new(AdmissionLimits {
            download_limit: 1,
            ..AdmissionLimits::default()
        });
        let cancel = CancellationToken::new();
        let held = controller.acquire(Operation::Download, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let trigger = waiter_cancel.clone();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire(Operation::Download, &waiter_cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ServiceError::Canceled)));

        drop(held);
        assert_eq!(controller.available(Operation::Download), 1);
    }

    #[tokio::test]
    async fn already_canceled_token_never_takes_capacity() {
        let controller = AdmissionController::new(AdmissionLimits::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = controller.acquire(Operation::List, &cancel).await;
        assert!(matches!(result, Err(ServiceError::Canceled)));
        assert_eq!(controller.available(Operation::List), 100);
    }
}
