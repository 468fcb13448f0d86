//! # chatvault-core
//!
//! Core types and abstractions for chatvault, the local chat session vault.
//!
//! This crate provides:
//! - Message and role primitives
//! - Session, summary and context-item records
//! - Configuration system (including compaction policy)
//! - Common error types

pub mod config;
pub mod error;
pub mod message;
pub mod session;

pub use config::{CompactConfig, Config};
pub use error::{Error, Result};
pub use message::{Message, Role};
pub use session::{ContextItem, Session, Summary};
