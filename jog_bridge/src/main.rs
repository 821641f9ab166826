use jog_bridge::{
    config::{create_default_config, init_config},
    connection::ConnectionManager,
    logging,
    machine::create_machine,
};
use std::path::PathBuf;
use tracing::info;

fn should_create_config() -> bool {
    std::env::var("CREATE_CONFIG")
        .map(|val| val == "1" || val.to_lowercase() == "true")
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if should_create_config() {
        create_default_config(None::<PathBuf>)?;
    }

    let (config_manager, config) = init_config().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Run with CREATE_CONFIG=1 to create a default configuration file.");
        e
    })?;

    let _log_guard = logging::init(&config.logging)?;
    info!("Loaded configuration from {}", config_manager.path().display());

    let machine = create_machine(&config.machine);
    let manager = ConnectionManager::new(config, machine.clone());

    tokio::select! {
        result = manager.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, releasing machine");
            machine.shutdown().await;
        }
    }

    Ok(())
}
