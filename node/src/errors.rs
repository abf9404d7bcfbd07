// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use eventsource_kernel::LogError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("a sink named {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("connector runtime is shutting down")]
    ShuttingDown,
}

pub type NodeResult<T> = Result<T, NodeError>;
