use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::ReconcileError;

/// Races a collaborator call against the reconcile's token. The call's own
/// result is returned untouched; a fired token yields `Canceled`.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, ReconcileError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Canceled),
        res = fut => res,
    }
}

pub fn check(cancel: &CancellationToken) -> Result<(), ReconcileError> {
    if cancel.is_cancelled() {
        Err(ReconcileError::Canceled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_canceled_when_token_fires_first() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            child.cancel();
        });
        let res: Result<(), _> = cancellable(&token, std::future::pending()).await;
        assert!(res.unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn passes_through_the_call_result() {
        let token = CancellationToken::new();
        let res = cancellable(&token, async { Ok::<_, ReconcileError>(7) }).await;
        assert_eq!(res.unwrap(), 7);
        token.cancel();
        assert!(check(&token).unwrap_err().is_canceled());
    }
}
