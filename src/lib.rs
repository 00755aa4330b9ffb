// Certwatch - Certificate Transparency log monitoring engine
// Copyright (C) 2025 Certwatch Team
// Licensed under GPL-2.0

//! Certwatch follows many append-only Certificate Transparency logs
//! concurrently, streams every newly-logged certificate through a fast
//! three-stage domain filter, and emits an event whenever a certificate
//! contains a DNS name under one of the watched registrable domains.
//!
//! The [`Engine`] is the main entry point: construct it with
//! [`EngineOptions`], register callbacks, and call `start`. The individual
//! building blocks (matcher, parser, stream processor, checkpoint store)
//! are public so embedders can compose them directly.

pub mod checkpoint;
pub mod config;
pub mod ctlog;
pub mod engine;
pub mod error;
pub mod events;
pub mod matcher;
pub mod parser;
pub mod processor;
pub mod watcher;

// Re-export commonly used types
pub use crate::config::{
    CheckpointConfig, EngineOptions, LogConfig, MatcherConfig, PerformanceConfig,
};
pub use crate::engine::{Engine, EngineStats, EngineStatus};
pub use crate::error::CtError;
pub use crate::events::{ErrorEvent, Event, EventKind, Severity, SubdomainEvent};
pub use crate::matcher::DomainMatcher;
pub use crate::parser::CertRecord;
pub use crate::watcher::{WatcherState, WatcherStatus};

/// Result type for certwatch operations
///
/// This is the standard Result type used throughout the crate, wrapping the
/// structured [`CtError`] enum for exhaustive matching.
pub type Result<T> = std::result::Result<T, CtError>;
