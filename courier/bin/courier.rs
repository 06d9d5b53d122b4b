#![deny(clippy::pedantic, clippy::all, clippy::nursery)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use courier::{Controller, CourierConfig, config::find_config_file};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CourierConfig::load(&find_config_file()?)?;

    // Messages live in the platform's own database. Embedders attach it by
    // passing their `MessageStore` to `Controller::run`.
    Controller::new(config).run(None).await
}
