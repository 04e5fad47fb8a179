//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate address syntax and value ranges
//! - Require a usable coordination-service source
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure: Config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::IpAddr;

use crate::config::schema::Config;

/// One semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn err(errors: &mut Vec<ValidationError>, field: &'static str, message: impl Into<String>) {
    errors.push(ValidationError {
        field,
        message: message.into(),
    });
}

/// Check everything serde cannot.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !config.name.contains('.') {
        err(&mut errors, "name", "must be a dotted service domain");
    }

    if config.trusted_ip.parse::<IpAddr>().is_err() {
        err(
            &mut errors,
            "trusted_ip",
            format!("{:?} is not an IP address", config.trusted_ip),
        );
    }
    for ip in config.trusted_ips.iter().chain(&config.untrusted_ips) {
        if ip.parse::<IpAddr>().is_err() {
            err(
                &mut errors,
                "trusted_ips/untrusted_ips",
                format!("{ip:?} is not an IP address"),
            );
        }
    }

    if config.coordination.servers.is_empty() && config.coordination.registrar_dir.is_none() {
        err(
            &mut errors,
            "coordination",
            "needs either servers or a registrar_dir",
        );
    }
    if config.coordination.session_timeout_ms == 0 {
        err(&mut errors, "coordination.session_timeout_ms", "must be positive");
    }
    if config.coordination.poll_interval_ms == 0 {
        err(&mut errors, "coordination.poll_interval_ms", "must be positive");
    }

    if config.haproxy.reload_cmd.trim().is_empty() {
        err(&mut errors, "haproxy.reload_cmd", "must not be empty");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
