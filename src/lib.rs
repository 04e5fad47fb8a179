//! HAProxy backend synchronization daemon library.

pub mod config;
pub mod core;
pub mod haproxy;
pub mod lifecycle;
pub mod net;
pub mod watch;

pub use config::schema::Config;
pub use core::backend::BackendSet;
pub use core::controller::Controller;
pub use lifecycle::Shutdown;
