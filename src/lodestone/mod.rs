pub mod admin;
pub mod app;
pub mod config;
pub mod firewall;
pub mod identity;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod reporter;
pub mod routes;
pub mod session;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
