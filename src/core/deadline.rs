use super::{DbError, Result};
use std::future::Future;
use std::time::Duration;

/// Run a store call, failing it with a remote error once `limit` elapses
pub async fn bounded<T, F>(command: &str, limit: Option<Duration>, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            DbError::remote(command, format!("operation exceeded time limit of {:?}", limit))
        })?,
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_through_without_limit() {
        let value = bounded("ping", None, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let err = bounded("find", Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_remote());
    }
}
