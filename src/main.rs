use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use rs_lighthouse::logging::setup_logger;
use rs_lighthouse::{Lighthouse, Options};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    let config = options.load_config().context("loading configuration")?;
    setup_logger(&config.logging.level);

    let server = Lighthouse::bind(config).await.context("starting lighthouse")?;

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received"),
            Err(e) => {
                error!("could not listen for ctrl-c: {}", e);
                return;
            }
        }
        cancel.cancel();
    });

    let stats = server.run().await?;
    info!(
        frames = stats.frames_processed,
        decoded = stats.decode_successes,
        broadcasts = stats.payloads_broadcast,
        "lighthouse stopped"
    );
    Ok(())
}
