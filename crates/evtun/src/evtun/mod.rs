pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod tunnel;

pub use app::RunOptions;

pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    app::run(opts).await
}
