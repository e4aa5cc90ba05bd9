#[tokio::main]
async fn main() -> anyhow::Result<()> {
    voice_client_lib::run().await
}
