mod ai;
mod app;
mod dashboard;
mod dedup;
mod error;
mod geo;
mod handlers;
mod limits;
mod prompting;
mod sales;
mod store;
#[cfg(test)]
mod testutil;
mod types;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    app::run().await;
}
