//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

/// Default per-proxy timeout in seconds (server read/write/idle and the
/// upstream client).
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 10;
/// Default graceful shutdown deadline in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Read buffer size for the TCP and UDP splice loops.
pub const DEFAULT_SPLICE_BUF_SIZE: usize = 64 * 1024;
/// Maximum UDP datagram size accepted by the DNS frontend.
pub const DEFAULT_DNS_UDP_PAYLOAD: usize = 4096;

/// Key-value state directory created in the working directory.
pub const STORAGE_DIR: &str = "storage";
