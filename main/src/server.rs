use tender_index::{bootstrap, init_tracing, serve};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let runtime = bootstrap().await?;
    serve(&runtime).await
}
