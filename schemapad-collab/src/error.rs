//! Crate-level error type.
//!
//! Each layer keeps its own error enum close to the code that raises it;
//! [`CollabError`] gathers them for the session-level API.

use schemapad_core::CoreError;
use thiserror::Error;

use crate::binding::BindingError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum CollabError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("preferences error: {0}")]
    Preferences(String),

    #[error("a schema needs a non-empty title")]
    EmptyTitle,

    #[error("session for room {0} is closed")]
    SessionClosed(String),
}

pub type CollabResult<T> = Result<T, CollabError>;
