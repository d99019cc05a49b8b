//! In-process message intake for engine callbacks.
//!
//! Every line lands in the polled [`MessageBuffer`]. A live logger may be
//! attached as well; it only exists inside the process that owns the relay.

use std::sync::Arc;

use hc_core::MessageBuffer;
use parking_lot::RwLock;

use crate::settings::LogLevel;

pub type LiveLogger = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

#[derive(Default)]
pub struct MessageRelay {
    buffer: MessageBuffer,
    live: RwLock<Option<LiveLogger>>,
}

impl MessageRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the engine's callback thread.
    pub fn publish(&self, level: LogLevel, line: &str) {
        self.buffer.append(line);
        if let Some(logger) = self.live.read().as_ref() {
            logger(level, line);
        }
    }

    pub fn attach_live(&self, logger: LiveLogger) {
        *self.live.write() = Some(logger);
    }

    pub fn detach_live(&self) {
        *self.live.write() = None;
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }
}

impl std::fmt::Debug for MessageRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay")
            .field("buffered", &self.buffer.len())
            .field("live", &self.live.read().is_some())
            .finish()
    }
}
