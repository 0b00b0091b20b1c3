mod chat;
mod repl;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use murmur_store::{MemoryGateway, RepositoryGateway, SqliteGateway};
use tracing_subscriber::EnvFilter;

use crate::chat::ChatController;
use crate::repl::ChatRepl;
use crate::settings::{DEFAULT_CONFIG_FILE, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::warn!(
                path = %config_path.display(),
                error = %error,
                "failed to load configuration, using defaults"
            );
            Settings::default().normalized()
        }
    };

    let completion = match murmur_llm::create_client(settings.provider_config()) {
        Ok(client) => client,
        Err(error) => {
            eprintln!("cannot start: {error}");
            eprintln!("set provider.api_key in {DEFAULT_CONFIG_FILE} or export OPENAI_API_KEY");
            return ExitCode::FAILURE;
        }
    };

    let gateway: Arc<dyn RepositoryGateway> = if settings.storage.database_path.is_empty() {
        Arc::new(MemoryGateway::new())
    } else {
        match SqliteGateway::open(&settings.storage.database_path).await {
            Ok(gateway) => Arc::new(gateway),
            Err(error) => {
                eprintln!("cannot open database: {error}");
                return ExitCode::FAILURE;
            }
        }
    };

    let model_id = settings.provider.model.clone();
    let mut controller = ChatController::new(settings.identity(), gateway, completion, model_id);
    controller.connect().await;

    ChatRepl::new(controller).run().await;
    ExitCode::SUCCESS
}
