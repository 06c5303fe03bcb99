mod server;

use anyhow::Result;
use tracing::info;

use ssfu_core::{logging, Config, SfuState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    logging::init_logging(&config.logging)?;
    info!("ssfu starting");
    info!("signalling address: ws://{}/signalling", config.listen_address());

    let state = SfuState::new(config.clone())?;

    server::serve(config, state).await
}
