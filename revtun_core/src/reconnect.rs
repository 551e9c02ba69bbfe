use log::{error, warn};
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry `dial` with exponential backoff and jitter.
///
/// The backoff starts at `base_secs`, doubles after every failure and is
/// capped at `max_secs`; each sleep additionally gets 0..1000 ms of random
/// jitter. `max_tries == 0` retries forever. Returns the first successful
/// dial result, or `None` once the attempts are exhausted.
pub async fn reconnect_with_backoff<F, Fut, T, E>(
    dial: F,
    base_secs: u64,
    max_secs: u64,
    max_tries: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    reconnect_with_sleeper(dial, base_secs, max_secs, max_tries, |d| {
        tokio::time::sleep(d)
    })
    .await
}

/// Same loop with the sleep primitive injected, so tests can drive it
/// without waiting out real backoffs.
pub async fn reconnect_with_sleeper<F, Fut, T, E, S, SFut>(
    mut dial: F,
    base_secs: u64,
    max_secs: u64,
    max_tries: usize,
    mut sleep: S,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
{
    let mut tries = 0usize;
    let mut interval = base_secs;
    loop {
        if max_tries > 0 && tries >= max_tries {
            error!("Giving up after {max_tries} connection attempts");
            return None;
        }
        match dial().await {
            Ok(value) => return Some(value),
            Err(e) => {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                let backoff = Duration::from_secs(interval) + jitter;
                warn!(
                    "Connection attempt {} failed: {e}; retrying in {:.1?}",
                    tries + 1,
                    backoff
                );
                sleep(backoff).await;
                interval = interval.saturating_mul(2);
                if interval > max_secs {
                    interval = max_secs;
                }
                tries += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_local = attempts.clone();
        let slept = Arc::new(Mutex::new(Vec::new()));
        let slept_local = slept.clone();

        let result = reconnect_with_sleeper(
            move || {
                let attempts = attempts_local.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err("connection refused")
                    } else {
                        Ok(7u32)
                    }
                }
            },
            1,
            8,
            0,
            move |d| {
                let slept = slept_local.clone();
                async move {
                    slept.lock().await.push(d);
                }
            },
        )
        .await;

        assert_eq!(result, Some(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        // Backoff doubles from the base; jitter adds less than a second.
        let slept = slept.lock().await;
        assert_eq!(slept.len(), 3);
        for (sleep, base) in slept.iter().zip([1u64, 2, 4]) {
            assert!(*sleep >= Duration::from_secs(base));
            assert!(*sleep < Duration::from_secs(base + 1));
        }
    }

    #[tokio::test]
    async fn backoff_is_capped_at_max() {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let slept_local = slept.clone();
        let result: Option<()> = reconnect_with_sleeper(
            || async { Err::<(), _>("down") },
            1,
            4,
            6,
            move |d| {
                let slept = slept_local.clone();
                async move {
                    slept.lock().await.push(d);
                }
            },
        )
        .await;

        assert_eq!(result, None);
        let slept = slept.lock().await;
        assert_eq!(slept.len(), 6);
        // 1, 2, 4, then pinned to the cap.
        for (sleep, base) in slept.iter().zip([1u64, 2, 4, 4, 4, 4]) {
            assert!(*sleep >= Duration::from_secs(base));
            assert!(*sleep < Duration::from_secs(base + 1));
        }
    }

    #[tokio::test]
    async fn zero_max_tries_keeps_retrying() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_local = attempts.clone();
        let result = reconnect_with_sleeper(
            move || {
                let attempts = attempts_local.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 50 {
                        Err("still down")
                    } else {
                        Ok(())
                    }
                }
            },
            0,
            0,
            0,
            |_| async {},
        )
        .await;
        assert_eq!(result, Some(()));
        assert_eq!(attempts.load(Ordering::SeqCst), 51);
    }
}
