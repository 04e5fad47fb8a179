//! Host network information.
//!
//! One-shot startup lookup of the machine's own addresses; nothing here
//! runs after setup completes.

pub mod addrs;
