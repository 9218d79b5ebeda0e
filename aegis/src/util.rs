//! Small process and retry helpers shared across modules.

use std::time::Duration;

use aegis_shared::errors::AegisResult;

/// Whether a process with the given pid exists (signal 0 probe).
pub fn is_process_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 only performs the existence/permission check.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Retry a transient operation with bounded backoff: 3 attempts, 200 ms
/// base, doubling. Non-transient errors surface immediately.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> AegisResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AegisResult<T>>,
{
    const ATTEMPTS: u32 = 3;
    const BASE: Duration = Duration::from_millis(200);

    let mut last = None;
    for attempt in 0..ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < ATTEMPTS => {
                let delay = BASE * 2u32.pow(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying transient failure");
                tokio::time::sleep(delay).await;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable: the loop always returns on the last attempt.
    Err(last.expect("retry loop exhausted without an error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_shared::errors::AegisError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AegisError::Io("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: AegisResult<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AegisError::Backend("dead".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
