use ingestion_pipeline::spawn_worker_pools;
use tender_index::{bootstrap, init_tracing, serve};
use tracing::info;

/// Runs the HTTP server and the ingestion workers in one process.
#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let runtime = bootstrap().await?;

    let workers = spawn_worker_pools(&runtime.db, &runtime.pipeline);
    info!(workers = workers.len(), "Ingestion workers running");

    let result = serve(&runtime).await;

    // The server only returns on failure; take the workers down with it.
    for handle in &workers {
        handle.abort();
    }

    result
}
