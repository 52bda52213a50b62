use std::future::Future;
use std::io;
use std::time::Duration;

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Bounds one I/O stage with the connection's idle deadline.
pub(crate) async fn with_deadline<T, E, F>(
    stage: &'static str,
    timeout: Duration,
    future: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(E::from(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "idle deadline exceeded during {stage} after {}ms",
                timeout.as_millis()
            ),
        ))),
    }
}

// Shutdown races against a peer that already closed are routine, not
// failures worth reporting.
pub(crate) fn ignored_shutdown_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::with_deadline;

    #[tokio::test]
    async fn deadline_converts_elapsed_into_timed_out() {
        let result: Result<(), io::Error> = with_deadline(
            "test stage",
            Duration::from_millis(10),
            std::future::pending(),
        )
        .await;
        let error = result.expect_err("must time out");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert!(error.to_string().contains("test stage"), "{error}");
    }

    #[tokio::test]
    async fn deadline_passes_through_inner_results() {
        let result: Result<u32, io::Error> =
            with_deadline("test stage", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.expect("must pass"), 7);
    }
}
