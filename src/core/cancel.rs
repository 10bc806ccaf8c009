//! Cancellation plumbing shared by the conversation engine and the tool
//! executor.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Marker returned by operations that were aborted by the user. Carries no
/// payload on purpose: the in-flight work is discarded wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

pub enum Cancellable<T> {
    Done(T),
    Cancelled,
}

/// Races `operation` against the token. With no token the operation runs to
/// completion unconditionally.
pub async fn run_cancellable<F>(
    cancel: Option<&CancellationToken>,
    operation: F,
) -> Cancellable<F::Output>
where
    F: Future,
{
    if let Some(token) = cancel {
        tokio::select! {
            _ = token.cancelled() => Cancellable::Cancelled,
            result = operation => Cancellable::Done(result),
        }
    } else {
        Cancellable::Done(operation.await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_token_wins_over_slow_operation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = run_cancellable(Some(&token), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            1
        })
        .await;
        assert!(matches!(result, Cancellable::Cancelled));
    }

    #[tokio::test]
    async fn missing_token_runs_to_completion() {
        let result = run_cancellable(None, async { 7 }).await;
        assert!(matches!(result, Cancellable::Done(7)));
    }
}
