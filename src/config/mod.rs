//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (JSON)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → Config (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the daemon restarts to pick up
//!   changes
//! - Validation separates syntactic (serde) from semantic checks and
//!   reports all errors, not just the first

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::Config;
pub use schema::CoordinationConfig;
pub use schema::HaproxyConfig;
