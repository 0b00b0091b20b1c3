use futures::future::BoxFuture;
use snafu::Snafu;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub base_url: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
            default_model,
        }
    }
}

/// Chat speaker role at the completion boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

impl CompletionMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One completion request: ordered role-tagged history, newest turn last.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model_id: String,
    pub messages: Vec<CompletionMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<CompletionMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type CompletionWorker = BoxFuture<'static, ()>;
pub type CompletionResult<T> = Result<T, CompletionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CompletionError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("completion request has no sendable messages"))]
    EmptyMessageSet {
        stage: &'static str,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completion failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider returned an empty reply for model '{model_id}'"))]
    EmptyReply {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("completion ended before a reply was delivered"))]
    ReplyChannelClosed {
        stage: &'static str,
    },
}

/// Pending reply plus its cancellation lever.
///
/// The reply resolves exactly once, with the full text or an error; there is
/// no partial delta fan-out. Dropping the handle cancels the worker.
pub struct CompletionHandle {
    reply: oneshot::Receiver<CompletionResult<String>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl CompletionHandle {
    /// Builds a handle plus the worker-side reply sender and cancel receiver.
    pub fn channel() -> (
        oneshot::Sender<CompletionResult<String>>,
        oneshot::Receiver<()>,
        Self,
    ) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (
            reply_tx,
            cancel_rx,
            Self {
                reply: reply_rx,
                cancel_tx: Some(cancel_tx),
            },
        )
    }

    /// Awaits the terminal reply. A worker that went away without answering
    /// (for example after cancellation) surfaces as `ReplyChannelClosed`.
    ///
    /// Dropping this future before it resolves leaves the handle intact, so
    /// a caller racing the reply against other input can retry the wait.
    pub async fn reply(&mut self) -> CompletionResult<String> {
        match (&mut self.reply).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CompletionError::ReplyChannelClosed {
                stage: "await-reply",
            }),
        }
    }

    /// Signals cancellation to the worker; best-effort, idempotent.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|cancel_tx| cancel_tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A started completion: the handle the caller keeps and the worker the
/// caller must spawn.
pub struct CompletionTicket {
    pub handle: CompletionHandle,
    pub worker: CompletionWorker,
}

pub trait CompletionClient: Send + Sync {
    fn complete(&self, request: CompletionRequest) -> CompletionResult<CompletionTicket>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_resolves_with_worker_reply() {
        let (reply_tx, _cancel_rx, mut handle) = CompletionHandle::channel();
        reply_tx.send(Ok("hello".to_string())).unwrap();

        assert_eq!(handle.reply().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn cancel_reaches_worker_once() {
        let (_reply_tx, mut cancel_rx, mut handle) = CompletionHandle::channel();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(cancel_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn reply_survives_an_abandoned_await() {
        let (reply_tx, _cancel_rx, mut handle) = CompletionHandle::channel();

        {
            let mut pending = Box::pin(handle.reply());
            assert!(futures::poll!(pending.as_mut()).is_pending());
        }

        reply_tx.send(Ok("kept".to_string())).unwrap();
        assert_eq!(handle.reply().await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn dropped_worker_surfaces_closed_channel() {
        let (reply_tx, _cancel_rx, mut handle) = CompletionHandle::channel();
        drop(reply_tx);

        assert!(matches!(
            handle.reply().await,
            Err(CompletionError::ReplyChannelClosed { .. })
        ));
    }
}
