#[tokio::main]
async fn main() -> eyre::Result<()> {
    hookline::run().await
}
