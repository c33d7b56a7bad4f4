//! Connectivity monitoring for a shared building with several ISPs.
//!
//! Residents register their public IPv4 address; the service classifies it
//! by ISP, pings every registered endpoint once per cycle (falling back to
//! the last responding router when an endpoint stops answering) and decides
//! per ISP whether an outage is in progress.

pub mod config;
pub mod database;
pub mod isp;
pub mod monitoring;
pub mod orchestrator;
pub mod pool;
pub mod registry;
