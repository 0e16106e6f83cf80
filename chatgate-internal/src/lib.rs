pub mod cache; // in-process TTL cache
pub mod config; // TOML configuration
pub mod endpoints; // HTTP handlers
pub mod error; // error handling
pub mod gateway_util; // app state and router
pub mod observability; // logging setup
pub mod rate_limit; // per-IP edge rate limiting
pub mod session; // session and client IP resolution
pub mod usage_limit; // daily message quota
