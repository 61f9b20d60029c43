use std::process::ExitCode;

use murmur::settings::SettingsStore;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Logs go to stderr so they never interleave with the chat on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = SettingsStore::load();
    tracing::info!(path = ?settings.config_path(), "settings loaded");

    match murmur::terminal::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "murmur stopped");
            eprintln!("murmur: {error}");
            ExitCode::FAILURE
        }
    }
}
