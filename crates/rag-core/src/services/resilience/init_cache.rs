use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::utils::error::{ClassifiedError, ErrorKind};

type Slot = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

static PROCESS_INIT: Lazy<Arc<InitCache>> = Lazy::new(|| Arc::new(InitCache::new()));

/// Named, initialize-once values (API clients, loaded models) shared by every
/// request a warm process handles. Contents disappear with the process.
#[derive(Default)]
pub struct InitCache {
    slots: DashMap<String, Slot>,
}

impl InitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by the whole process.
    pub fn global() -> Arc<InitCache> {
        PROCESS_INIT.clone()
    }

    /// Return the value stored under `key`, running `init` if nothing is stored
    /// yet. Concurrent callers wait for the single in-flight `init`; a failed
    /// `init` leaves the slot empty so a later call tries again.
    pub async fn get_or_try_init<T, F, Fut>(&self, key: &str, init: F) -> Result<Arc<T>, ClassifiedError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let value = slot
            .get_or_try_init(|| async move {
                let value = init().await?;
                info!("Initialized shared resource '{}'", key);
                Ok::<_, ClassifiedError>(Arc::new(value) as Arc<dyn Any + Send + Sync>)
            })
            .await?;

        value.clone().downcast::<T>().map_err(|_| {
            ClassifiedError::new(
                ErrorKind::Unknown,
                format!("shared resource '{}' holds a different type", key),
            )
        })
    }

    pub fn is_initialized(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_initializes_once() {
        let cache = InitCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_try_init("client", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(String::from("connected"))
                })
                .await
                .unwrap();
            assert_eq!(value.as_str(), "connected");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_initialized("client"));
    }

    #[tokio::test]
    async fn test_failed_init_is_retried() {
        let cache = InitCache::new();

        let first = cache
            .get_or_try_init::<u32, _, _>("model", || async {
                Err(ClassifiedError::dependency("download failed"))
            })
            .await;
        assert!(first.is_err());
        assert!(!cache.is_initialized("model"));

        let second = cache
            .get_or_try_init("model", || async { Ok(7u32) })
            .await
            .unwrap();
        assert_eq!(*second, 7);
    }

    #[tokio::test]
    async fn test_type_mismatch() {
        let cache = InitCache::new();
        cache.get_or_try_init("x", || async { Ok(1u8) }).await.unwrap();
        let err = cache
            .get_or_try_init::<String, _, _>("x", || async { Ok(String::new()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }
}
