#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pos_order_sync::run().await
}
