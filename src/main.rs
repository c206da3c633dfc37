mod app;
mod autoreply;
mod error;
mod normalize;
mod outbound;
mod types;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    app::run().await;
}
