#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_server::run().await
}
