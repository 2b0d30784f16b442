// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logger Capability
//!
//! The dispatcher never writes to a process-wide logger on its own. Every
//! component receives a [`Logger`] handle from the [`ServerConfig`] it was
//! built from, and reports reconnection attempts, topology installation and
//! consumer re-subscription through it.
//!
//! [`TracingLogger`] is the default implementation and forwards every entry to
//! `tracing` with the structured fields rendered as `key=value` pairs.
//!
//! [`ServerConfig`]: crate::config::ServerConfig

use std::fmt::{Display, Write};
use tracing::{debug, error, info, warn};

/// Structured key/value pairs attached to a log entry.
pub type Fields<'a> = &'a [(&'a str, &'a dyn Display)];

/// Minimal logging capability injected into the dispatcher.
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str, fields: Fields<'_>);
    fn info(&self, message: &str, fields: Fields<'_>);
    fn warn(&self, message: &str, fields: Fields<'_>);
    fn error(&self, message: &str, fields: Fields<'_>);
}

/// Logger backed by the `tracing` macros.
///
/// Debug entries are only forwarded when the logger was built in debug mode,
/// mirroring the `debug_mode` switch of the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger {
    debug_mode: bool,
}

impl TracingLogger {
    pub fn new(debug_mode: bool) -> Self {
        TracingLogger { debug_mode }
    }
}

impl Logger for TracingLogger {
    fn debug(&self, message: &str, fields: Fields<'_>) {
        if self.debug_mode {
            debug!(fields = %render(fields), "{}", message);
        }
    }

    fn info(&self, message: &str, fields: Fields<'_>) {
        info!(fields = %render(fields), "{}", message);
    }

    fn warn(&self, message: &str, fields: Fields<'_>) {
        warn!(fields = %render(fields), "{}", message);
    }

    fn error(&self, message: &str, fields: Fields<'_>) {
        error!(fields = %render(fields), "{}", message);
    }
}

/// Renders structured fields as space separated `key=value` pairs.
pub(crate) fn render(fields: Fields<'_>) -> String {
    let mut out = String::new();
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}={}", key, value);
    }
    out
}
