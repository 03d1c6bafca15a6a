use futures::future::join_all;
use ingestion_pipeline::spawn_worker_pools;
use tender_index::{bootstrap, init_tracing};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let runtime = bootstrap().await?;
    let handles = spawn_worker_pools(&runtime.db, &runtime.pipeline);
    info!(workers = handles.len(), "Ingestion workers running");

    for result in join_all(handles).await {
        if let Err(err) = result {
            error!(error = %err, "Worker task ended unexpectedly");
        }
    }

    Ok(())
}
