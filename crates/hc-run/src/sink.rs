//! Destinations for drained engine messages.

use tracing::info;

pub trait MessageSink {
    fn forward(&self, model: &str, line: &str);
}

/// Logs engine lines under the `engine` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn forward(&self, model: &str, line: &str) {
        info!(target: "engine", model, "{line}");
    }
}
