//! Remote selection for the CLI.

use memosync_core::{HttpRemote, PendingOperation, PullResponse, PushOutcome, RemoteError, RemoteStore};

/// The remote the engine talks to. Local-only commands run without one.
#[derive(Debug)]
pub enum CliRemote {
    Http(HttpRemote),
    Unconfigured,
}

impl CliRemote {
    pub const fn is_configured(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

fn unconfigured() -> RemoteError {
    RemoteError::Network("no remote configured".to_string())
}

impl RemoteStore for CliRemote {
    async fn pull(&self, since: Option<i64>) -> Result<PullResponse, RemoteError> {
        match self {
            Self::Http(remote) => remote.pull(since).await,
            Self::Unconfigured => Err(unconfigured()),
        }
    }

    async fn push(&self, operation: &PendingOperation) -> Result<PushOutcome, RemoteError> {
        match self {
            Self::Http(remote) => remote.push(operation).await,
            Self::Unconfigured => Err(unconfigured()),
        }
    }
}
