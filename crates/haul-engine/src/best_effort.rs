use std::fmt::Display;
use std::future::Future;

/// Await a side effect whose failure must not fail the caller. Errors are
/// logged and swallowed.
pub async fn attempt<T, E, F>(what: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(operation = what, error = %e, "best-effort operation failed");
            None
        }
    }
}
