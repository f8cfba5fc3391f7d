use std::future::Future;

use tokio::time::Instant;
use tracing::debug;

pub async fn timed<F: Future>(label: &'static str, future: F) -> F::Output {
    let start = Instant::now();
    let output = future.await;
    debug!(
        target: "performance",
        label,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "{label} finished"
    );
    output
}
