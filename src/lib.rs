/*
 * Copyright (c) 2025 MirageDB contributors. All rights reserved.
 *
 * MirageDB - MongoDB-compatible database facade
 *
 * @file lib.rs
 * @brief MirageDB library entry point
 */

pub mod error;
pub mod logger;
pub mod config;

// Query execution core
pub mod value;
pub mod matcher;
pub mod update;
pub mod expression;
pub mod aggregation;
pub mod cursor;
pub mod router;

// Storage boundary
pub mod backend;
pub mod memory_backend;
pub mod change_stream;

// Wire surface
pub mod auth;
pub mod uri;
pub mod validation;
pub mod wire_protocol;
pub mod commands;
pub mod server;

// Infrastructure
pub mod shutdown;
pub mod health;

// Re-export main types for external use
pub use error::{MirageError, Result};
pub use config::Config;
pub use aggregation::{AggregationPipeline, CollectionProvider, PipelineContext, VectorSearch};
pub use backend::{DocumentBackend, FindQuery, FindResult, UpdateSummary};
pub use memory_backend::MemoryBackend;
pub use change_stream::{ChangeEvent, ChangeStreamBroker, OperationType};
pub use cursor::{Cursor, CursorRegistry, FetchSource, Namespace};
pub use router::{BackendKind, QueryCharacteristics, QueryRouter, RouteDecision, RouterConfig};
pub use auth::{CredentialStore, ScramCredential, ScramServer};
pub use uri::ConnectionUri;
pub use commands::{CommandProcessor, Session};
pub use server::MirageServer;
pub use shutdown::{ShutdownConfig, ShutdownManager, ShutdownReason};
pub use logger::{init_logger, init_tracing_logger, LogLevel, MirageLogger};
