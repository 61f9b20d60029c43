use murmur_llm::ProviderError;
use murmur_storage::{SessionId, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("chat store unavailable on `{stage}`: {source}"))]
    StoreUnavailable {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("completion failed on `{stage}`: {source}"))]
    CompletionFailed {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("session {session_id} already has a response in flight"))]
    StreamInProgress {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("failed to read image at {path:?} on `{stage}`: {source}"))]
    ReadImage {
        stage: &'static str,
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
