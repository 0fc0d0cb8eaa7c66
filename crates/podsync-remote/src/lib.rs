//! podsync Remote - Podio REST API adapter
//!
//! Provides:
//! - An authenticated HTTP client for the Podio API
//! - Classification of Podio error responses, including its several
//!   ways of signalling rate limits
//! - Quota header and Retry-After parsing
//! - The [`IRemoteApi`](podsync_core::ports::IRemoteApi) implementation used by the engine
//!
//! ## Modules
//!
//! - [`client`] - PodioClient (auth header, URLs, error classification)
//! - [`headers`] - Rate-limit headers and wait extraction
//! - [`provider`] - PodioRemote, the remote port implementation

pub mod client;
pub mod headers;
pub mod provider;

pub use client::PodioClient;
pub use provider::PodioRemote;
