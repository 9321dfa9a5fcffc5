//! Relay error types and their integer result codes

use thiserror::Error;

use crate::relay::buffer::BufferId;

/// Integer result classes reported to callers that only understand codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    /// Invalid argument passed to a setup call
    BadValue = -2,
    /// A queue operation failed
    BadOperate = -5,
    /// Initialization failed
    InitErr = -6,
}

impl ErrorCode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Failure reported by a buffer queue collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("no buffer available")]
    NoBuffer,
    #[error("queue is full")]
    Full,
    #[error("buffer {0} is not owned by this queue")]
    NotOwned(BufferId),
    #[error("queue has been abandoned")]
    Abandoned,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("queue backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("relay engine already initialized or torn down")]
    AlreadyInitialized,
    #[error("invalid geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
    #[error("failed to create camera consumer surface")]
    SurfaceCreation,
    #[error("failed to configure camera consumer surface")]
    Configure(#[source] QueueError),
    #[error("failed to register buffer listener")]
    ListenerRegistration(#[source] QueueError),
    #[error("failed to derive camera producer surface")]
    ProducerUnavailable,
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("encoder surface handle is null")]
    InvalidHandle,
    #[error("encoder surface rejected release listener")]
    RegistrationFailed(#[source] QueueError),
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("failed to forward buffer {id} to encoder")]
    ForwardFailed {
        id: BufferId,
        #[source]
        source: QueueError,
    },
    #[error("failed to return buffer {id} to camera")]
    ReturnFailed {
        id: BufferId,
        #[source]
        source: QueueError,
    },
}

impl InitError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InitError::InvalidGeometry { .. } => ErrorCode::BadValue,
            InitError::ListenerRegistration(_) | InitError::Configure(_) => ErrorCode::BadOperate,
            InitError::AlreadyInitialized
            | InitError::SurfaceCreation
            | InitError::ProducerUnavailable => ErrorCode::InitErr,
        }
    }
}

impl BindError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BindError::InvalidHandle => ErrorCode::BadValue,
            BindError::RegistrationFailed(_) => ErrorCode::BadOperate,
        }
    }
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Init(e) => e.code(),
            RelayError::Bind(e) => e.code(),
            RelayError::ForwardFailed { .. } | RelayError::ReturnFailed { .. } => {
                ErrorCode::BadOperate
            }
        }
    }
}

/// Collapse a relay result into its integer code
pub fn result_code<T>(result: &Result<T, RelayError>) -> i32 {
    match result {
        Ok(_) => ErrorCode::Ok.as_i32(),
        Err(e) => e.code().as_i32(),
    }
}
