//! Line-oriented terminal client over the chat core.

pub mod command;
pub mod renderer;

use std::sync::Arc;

use murmur_llm::ProviderError;
use murmur_storage::{ChatStore, MemoryStore, SqliteStore, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::chat::{ChatSessionManager, ImageAttachment, SendOutcome, SessionContext};
use crate::settings::{SettingsStore, StorageSettings};

pub use command::{Command, HELP, parse_command};
pub use renderer::TerminalRenderer;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TerminalError {
    #[snafu(display("failed to open chat store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to create completion client on `{stage}`: {source}"))]
    CreateClient {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub async fn open_store(storage: &StorageSettings) -> Result<Arc<dyn ChatStore>, TerminalError> {
    if storage.in_memory {
        tracing::info!("using in-memory chat store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let path = storage.resolved_database_path();
    let store = SqliteStore::open(&path.to_string_lossy())
        .await
        .context(OpenStoreSnafu {
            stage: "open-sqlite-store",
        })?;
    Ok(Arc::new(store))
}

struct Session {
    settings: SettingsStore,
    manager: ChatSessionManager,
    renderer: Arc<TerminalRenderer>,
}

enum Flow {
    Continue,
    Quit,
}

impl Session {
    async fn current_or_new(&self) -> Option<murmur_storage::SessionId> {
        match self.manager.current_session() {
            Some(session_id) => Some(session_id),
            None => self.manager.new_chat().await,
        }
    }

    async fn handle(&self, command: Command) -> Flow {
        match command {
            Command::Quit => return Flow::Quit,
            Command::Help => println!("{HELP}"),
            Command::Invalid(usage) => self.renderer.notice(usage),
            Command::Send(text) => {
                let Some(session_id) = self.current_or_new().await else {
                    self.renderer.notice("no chat available, check the logs");
                    return Flow::Continue;
                };
                if self.manager.send_user_message(session_id, &text).await == SendOutcome::Busy {
                    self.renderer.notice("still answering, wait for the reply");
                }
            }
            Command::NewChat => {
                if self.manager.new_chat().await.is_none() {
                    self.renderer.notice("could not start a new chat");
                }
            }
            Command::Temporary(temporary) => {
                self.manager.set_temporary(temporary);
                let state = if temporary { "on" } else { "off" };
                self.renderer
                    .notice(&format!("temporary chats {state}; applies to the next /new"));
            }
            Command::List => self.renderer.request_list(),
            Command::Open(index) => match self.renderer.session_at(index) {
                Some(session_id) => {
                    if let Err(error) = self.manager.load_session(session_id).await {
                        tracing::error!(session_id = %session_id, error = %error, "failed to open chat");
                        self.renderer.notice("could not open that chat");
                    }
                }
                None => self.renderer.notice("no chat at that position, try /list"),
            },
            Command::Delete(index) => match self.renderer.session_at(index) {
                Some(session_id) => {
                    if let Err(error) = self.manager.delete_session(session_id).await {
                        tracing::error!(session_id = %session_id, error = %error, "failed to delete chat");
                        self.renderer.notice("could not delete that chat");
                    } else if self.manager.current_session().is_none() {
                        self.manager.new_chat().await;
                    }
                }
                None => self.renderer.notice("no chat at that position, try /list"),
            },
            Command::Image(path) => {
                let image = match ImageAttachment::from_path(&path).await {
                    Ok(image) => image,
                    Err(error) => {
                        tracing::warn!(error = %error, "image not readable");
                        self.renderer.notice(&error.to_string());
                        return Flow::Continue;
                    }
                };
                if let Some(session_id) = self.current_or_new().await {
                    self.manager.send_image_message(session_id, image).await;
                }
            }
            Command::Model(model) => self.switch_model(model),
        }
        Flow::Continue
    }

    fn switch_model(&self, model: String) {
        let settings = match self
            .settings
            .update_with(|settings| settings.provider.model = model)
        {
            Ok(settings) => settings,
            Err(error) => {
                tracing::error!(error = %error, "failed to save settings");
                self.renderer.notice("could not save the model choice");
                return;
            }
        };

        match murmur_llm::create_client(settings.provider.to_provider_config()) {
            Ok(client) => {
                self.manager.replace_client(client);
                self.renderer
                    .notice(&format!("model set to {}", settings.provider.model));
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to rebuild completion client");
                self.renderer.notice("model saved, but the client could not be rebuilt");
            }
        }
    }
}

/// Runs the chat loop until `/quit` or end of input.
pub async fn run(settings: SettingsStore) -> Result<(), TerminalError> {
    let current = settings.settings();
    let store = open_store(&current.storage).await?;
    let client = murmur_llm::create_client(current.provider.to_provider_config()).context(
        CreateClientSnafu {
            stage: "create-completion-client",
        },
    )?;

    let renderer = Arc::new(TerminalRenderer::new());
    let manager = ChatSessionManager::new(
        SessionContext::new(current.user_id.as_str()),
        store,
        client,
        renderer.clone(),
        current.prompts.to_chat_prompts(),
    );
    let session = Session {
        settings,
        manager,
        renderer,
    };

    if let Err(error) = session.manager.list_sessions().await {
        tracing::warn!(error = %error, "chat list unavailable");
    }
    session.manager.new_chat().await;
    println!("murmur: type a message, or /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-stdin-line",
    })? {
        if let Flow::Quit = session.handle(parse_command(&line)).await {
            break;
        }
    }

    session.manager.shutdown();
    tracing::info!("terminal session ended");
    Ok(())
}
