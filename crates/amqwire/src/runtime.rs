//! Entry-point harness for programs whose main job is one connection.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// How long runtime shutdown waits for stray blocking work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Drive `future` to completion on a fresh single-threaded runtime,
/// stopping early with [`Error::Interrupted`] on ctrl-c.
///
/// Refuses to run inside an existing async runtime: callers that already
/// have one should await their future directly.
pub fn run<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::RuntimeActive);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async move {
        tokio::pin!(future);
        tokio::select! {
            result = &mut future => result,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("interrupted, shutting down");
                Err(Error::Interrupted)
            }
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
