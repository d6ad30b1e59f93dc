//! Load-shed flag (§5): a background refresher polls a shared cache key
//! on a short period and caches the result for lock-free reads on the
//! hot path, mirroring the source system's `ContextVar`-cached flag with
//! throttled logging (state transitions or a heartbeat every N cycles).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_clients::Cache;
use tokio_util::sync::CancellationToken;

const LOAD_SHED_CACHE_KEY: &str = "gateway:load_shed";

/// Process-scope, lock-free load-shed flag.
#[derive(Clone)]
pub struct LoadShedState {
    flag: Arc<AtomicBool>,
}

impl LoadShedState {
    /// A state that starts in the non-shedding position.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `true` when the gateway should short-circuit new requests.
    #[must_use]
    pub fn is_shedding(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn set(&self, value: bool) {
        self.flag.store(value, Ordering::Relaxed);
    }
}

impl Default for LoadShedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `cache` for [`LOAD_SHED_CACHE_KEY`] on `period` until `token` is
/// cancelled, writing transitions into `state` and logging on
/// transition or every `heartbeat_cycles` polls.
pub async fn run_refresher(
    state: LoadShedState,
    cache: Arc<dyn Cache>,
    period: Duration,
    heartbeat_cycles: u32,
    token: CancellationToken,
) {
    let mut cycles: u32 = 0;
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(period) => {}
        }
        cycles = cycles.wrapping_add(1);
        let observed = match cache.get(LOAD_SHED_CACHE_KEY).await {
            Ok(Some(bytes)) => bytes.first() == Some(&b'1'),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(event = "load_shed_poll_failed", error = %e, "load shed poll failed, keeping previous state");
                continue;
            }
        };
        let previous = state.is_shedding();
        state.set(observed);
        let heartbeat_due = heartbeat_cycles > 0 && cycles % heartbeat_cycles == 0;
        if observed != previous {
            tracing::info!(event = "load_shed_transition", load_shed = observed, "load shed state changed");
        } else if heartbeat_due {
            tracing::debug!(event = "load_shed_heartbeat", load_shed = observed, cycles, "load shed heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_clients::InMemoryCache;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn refresher_picks_up_transition() {
        let cache = Arc::new(InMemoryCache::new());
        cache
            .set_ex(LOAD_SHED_CACHE_KEY, b"1".to_vec(), StdDuration::from_secs(60))
            .await
            .unwrap();
        let state = LoadShedState::new();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_refresher(
            state.clone(),
            cache,
            Duration::from_millis(5),
            1000,
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(state.is_shedding());
        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn defaults_to_not_shedding() {
        let state = LoadShedState::new();
        assert!(!state.is_shedding());
    }
}
