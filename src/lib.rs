//! dexkeeper — runs Dex with a config rendered from live settings.
//!
//! Renders settings into a Dex config, starts Dex with it, and restarts Dex
//! only when a settings change produces a different config. Secrets in the
//! rendered config are masked before it is logged or printed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dex;
pub mod files;
pub mod logging;
pub mod redactor;
pub mod settings;
pub mod supervisor;
pub mod tls;
