#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pos_outbox::run().await
}
