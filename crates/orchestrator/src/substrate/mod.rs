//! Durable substrate and state persistence
//!
//! This module provides:
//! - [`SubstrateAdapter`] trait for the append-only message log
//! - [`StateStore`] trait for workflow checkpoints and dead letters
//! - [`InMemorySubstrate`] and [`InMemoryStateStore`] for testing
//! - [`PostgresSubstrate`] implementing both traits for production

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryStateStore, InMemorySubstrate};
pub use postgres::PostgresSubstrate;
pub use store::{
    DeadLetterFilter, Offset, Pagination, StateStore, StoreError, SubstrateAdapter,
    SubstrateError, SubstrateRecord, WorkflowFilter,
};
