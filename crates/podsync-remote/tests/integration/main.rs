//! Integration tests for podsync-remote
//!
//! Uses wiremock to simulate the Podio API and verifies end-to-end
//! behavior of PodioRemote: listings, rate-limit classification and
//! the export workflow.

mod common;

mod test_export;
mod test_listing;
mod test_rate_limits;
