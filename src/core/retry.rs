use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Outcome of one attempt: either give up now or let the schedule decide.
pub enum Attempt<T, E> {
    Done(Result<T, E>),
    Retry(E),
}

/// Run `op` until it succeeds, returns a permanent failure, or the schedule is
/// exhausted. `delays[i]` is the pause before attempt `i + 2`; the total number
/// of attempts is `max_attempts` (the last delay repeats if the list is short).
pub async fn with_backoff<T, E, F, Fut>(
    label: &str,
    max_attempts: usize,
    delays: &[Duration],
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Attempt::Done(result) => return result,
            Attempt::Retry(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                let delay = delays
                    .get(attempt - 1)
                    .or(delays.last())
                    .copied()
                    .unwrap_or(Duration::ZERO);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label, attempt, max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// HTTP statuses worth retrying: throttling and server-side failures.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
