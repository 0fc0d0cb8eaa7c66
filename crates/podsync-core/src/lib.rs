//! podsync Core - Domain logic and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `ScanJob`, `TraversalCheckpoint`, `DiscoveredEntity`,
//!   `QuotaBucket`, `AsyncExportJob`
//! - **Error taxonomy** - `ScanError` (traversal outcomes) and `DomainError`
//!   (validation and state transitions)
//! - **Port definitions** - Traits for adapters: `IRemoteApi`, `ICheckpointStore`,
//!   `IWritePathSink`, `IProgressSink`
//! - **Configuration** - YAML-backed `Config` with validation
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement, and the
//! `podsync-engine` crate drives the domain through those ports.

pub mod config;
pub mod domain;
pub mod ports;
