//! Log-message spy.
//!
//! Every WARN or ERROR event the worker emits is checked against a list of
//! expectations. A match consumes the expectation; anything else counts as
//! unexpected. CLEAR_LOG_MESSAGES reads and resets both numbers.

use std::sync::{Arc, Mutex};

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::MessageCount;

pub trait LogSpy: Send + Sync {
    /// Expect one WARN/ERROR message from `logger` containing `partial`.
    fn expect(&self, logger: &str, partial: &str);

    /// Expectations still unmet and unexpected messages seen, then reset.
    fn drain_counts(&self) -> MessageCount;
}

#[derive(Debug, Clone)]
struct Expectation {
    logger: String,
    partial: String,
}

impl Expectation {
    fn matches(&self, target: &str, message: &str) -> bool {
        let logger_matches = target == self.logger
            || target
                .strip_prefix(self.logger.as_str())
                .is_some_and(|rest| rest.starts_with("::"));
        logger_matches && message.contains(&self.partial)
    }
}

#[derive(Debug, Default)]
struct Book {
    expected: Vec<Expectation>,
    unexpected: u32,
}

/// Shared bookkeeping between the layer and whoever answers CLEAR_LOG_MESSAGES.
#[derive(Debug, Clone, Default)]
pub struct SpyBook {
    inner: Arc<Mutex<Book>>,
}

impl SpyBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(&self) -> SpyingLayer {
        SpyingLayer { book: self.clone() }
    }

    fn observe(&self, target: &str, message: &str) {
        let Ok(mut book) = self.inner.lock() else {
            return;
        };
        match book.expected.iter().position(|e| e.matches(target, message)) {
            Some(idx) => {
                book.expected.remove(idx);
            }
            None => book.unexpected = book.unexpected.saturating_add(1),
        }
    }
}

impl LogSpy for SpyBook {
    fn expect(&self, logger: &str, partial: &str) {
        if let Ok(mut book) = self.inner.lock() {
            book.expected.push(Expectation {
                logger: logger.to_string(),
                partial: partial.to_string(),
            });
        }
    }

    fn drain_counts(&self) -> MessageCount {
        let Ok(mut book) = self.inner.lock() else {
            return MessageCount::default();
        };
        let book = std::mem::take(&mut *book);
        MessageCount {
            expected: u32::try_from(book.expected.len()).unwrap_or(u32::MAX),
            unexpected: book.unexpected,
        }
    }
}

/// Feeds WARN and ERROR events into a [`SpyBook`].
pub struct SpyingLayer {
    book: SpyBook,
}

impl<S> Layer<S> for SpyingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.book.observe(metadata.target(), &visitor.message);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
