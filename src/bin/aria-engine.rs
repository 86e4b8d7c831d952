use anyhow::Result;
use aria_config::ConfigHandle;
use aria_engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    aria_log::init();
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/aria/aria.conf".to_string());
    let config = ConfigHandle::load(&path)?;
    Engine::new(config).run().await?;
    Ok(())
}
