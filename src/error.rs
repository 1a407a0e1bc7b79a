/*
 * Copyright (c) 2025 MirageDB contributors. All rights reserved.
 *
 * MirageDB - MongoDB-compatible database facade
 *
 * @file error.rs
 * @brief MirageDB error handling
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirageError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Write concern error: {0}")]
    WriteConcern(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation exceeded time limit: {0}")]
    Timeout(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Cursor {0} not found")]
    CursorNotFound(i64),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("No such command: {0}")]
    CommandNotFound(String),

    #[error("Wire protocol error: {0}")]
    WireProtocol(String),

    #[error("BSON error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("BSON serialization error: {0}")]
    BsonSerialization(#[from] bson::ser::Error),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirageError {
    /// MongoDB wire error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            MirageError::InvalidArgument(_) => 2,
            MirageError::NotConnected(_) => 6,
            MirageError::InvalidOperation(_) => 20,
            MirageError::DuplicateKey(_) => 11000,
            MirageError::WriteConcern(_) => 64,
            MirageError::Connection(_) => 6,
            MirageError::Timeout(_) => 50,
            MirageError::Aborted(_) => 11601,
            MirageError::CursorNotFound(_) => 43,
            MirageError::Unauthorized(_) => 13,
            MirageError::CommandNotFound(_) => 59,
            MirageError::WireProtocol(_) => 17,
            MirageError::Bson(_) | MirageError::BsonSerialization(_) => 14,
            MirageError::Serialization(_) => 9,
            MirageError::Network(_) | MirageError::Internal(_) => 1,
        }
    }

    /// MongoDB codeName string matching `code()`.
    pub fn code_name(&self) -> &'static str {
        match self {
            MirageError::InvalidArgument(_) => "BadValue",
            MirageError::NotConnected(_) => "HostUnreachable",
            MirageError::InvalidOperation(_) => "IllegalOperation",
            MirageError::DuplicateKey(_) => "DuplicateKey",
            MirageError::WriteConcern(_) => "WriteConcernFailed",
            MirageError::Connection(_) => "HostUnreachable",
            MirageError::Timeout(_) => "MaxTimeMSExpired",
            MirageError::Aborted(_) => "Interrupted",
            MirageError::CursorNotFound(_) => "CursorNotFound",
            MirageError::Unauthorized(_) => "Unauthorized",
            MirageError::CommandNotFound(_) => "CommandNotFound",
            MirageError::WireProtocol(_) => "ProtocolError",
            MirageError::Bson(_) | MirageError::BsonSerialization(_) => "TypeMismatch",
            MirageError::Serialization(_) => "FailedToParse",
            MirageError::Network(_) | MirageError::Internal(_) => "InternalError",
        }
    }

    /// True for errors that should tear down the client connection rather
    /// than travel back as a command response.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MirageError::WireProtocol(_) | MirageError::Network(_) | MirageError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MirageError>;
