// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Built-in notification handlers

mod json;
mod log;

pub use json::JsonHandler;
pub use log::LogHandler;

use std::sync::Arc;

use crate::config::{HandlerConfig, HandlerKind};
use crate::controller::Handler;

pub fn from_config(config: &HandlerConfig) -> Arc<dyn Handler> {
    match config.kind {
        HandlerKind::Log => Arc::new(LogHandler),
        HandlerKind::Json => Arc::new(JsonHandler::stdout()),
    }
}

/// Human-readable sentence for a change
pub(crate) fn describe(resource_type: &str, namespace: &str, name: &str, action: &str) -> String {
    if namespace.is_empty() {
        format!("A `{}` has been `{}`: `{}`", resource_type, action, name)
    } else {
        format!(
            "A `{}` in namespace `{}` has been `{}`: `{}`",
            resource_type, namespace, action, name
        )
    }
}
