use anyhow::Context as _;
use unmta::{
    config::Unfig, error::ConfigError, internal, logging, plugin::PluginManager, server::Server,
};

const DEFAULT_CONFIG: &str = "unmta.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Unfig::load(&path).with_context(|| format!("loading {path}"))?,
        // No explicit path: a missing default file just means defaults
        None => match Unfig::load(DEFAULT_CONFIG) {
            Ok(config) => config,
            Err(ConfigError::Read { .. }) => Unfig::default(),
            Err(err) => return Err(err.into()),
        },
    };

    let level = config.log.level;
    logging::init(level);

    internal!(level = INFO, "Unfig (config) loaded");
    internal!(level = INFO, "Logger initialized. Level: '{level}'");

    let bound = Server::new(config, PluginManager::default()).bind().await?;
    let handle = bound.shutdown_handle();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        internal!(level = INFO, "CTRL+C entered, stopping ...");
        handle.shutdown();
    });

    bound.serve().await?;

    Ok(())
}
