use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::peers::PeerBookError;
use crate::probation::ProbationError;
use crate::session::SessionError;
use crate::state::StateError;
use crate::store::StoreError;

/// Crate-level convenience error: a thin wrapper over the per-module
/// errors plus the engine lifecycle failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    PeerBook(#[from] PeerBookError),

    #[error(transparent)]
    Probation(#[from] ProbationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine not started")]
    NotStarted,

    #[error("shutdown incomplete after {waited:?}: {pending}")]
    ShutdownIncomplete { waited: Duration, pending: String },
}
