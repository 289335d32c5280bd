//! Shared types, error model, and configuration for the helpdesk pipeline.
//!
//! This crate is the foundation depended on by all other helpdesk crates.
//! It provides:
//! - [`HelpdeskError`], the unified error type
//! - Domain types ([`PipelineState`], [`Document`], [`Intent`], [`FinalResponse`], [`Step`])
//! - Checkpoint records ([`RunConfig`], [`Checkpoint`], [`CheckpointTuple`], [`PendingWrite`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointTuple, DEFAULT_CHECKPOINT_NS, ListFilter,
    PENDING_CHECKPOINT_ID, PendingWrite, RunConfig, RunStatus, new_checkpoint_id,
    sort_pending_writes,
};
pub use config::{
    AppConfig, CacheConfig, OllamaConfig, PipelineConfig, PipelineSection, RetrieverConfig,
    StorageConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from,
};
pub use error::{HelpdeskError, Result};
pub use types::{Document, FinalResponse, Intent, PipelineState, Step};
