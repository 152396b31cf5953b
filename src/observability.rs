//! Structured failure reporting for ingestion and generation.

use crate::document::ArticleId;
use log::{error, info, warn};
use std::sync::{Mutex, PoisonError};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An ingestion attempt failed and will be retried
    IngestionRetry,
    /// Ingestion gave up; the previous index stays in place
    IngestionExhausted,
    /// Ingestion failed with an error that is not worth retrying
    IngestionFailed,
    /// A question could not be answered
    GenerationError,
    /// An index was built with another embedding model and needs rebuilding
    IndexInvalidated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IngestionRetry => "ingestion_retry",
            EventKind::IngestionExhausted => "ingestion_exhausted",
            EventKind::IngestionFailed => "ingestion_failed",
            EventKind::GenerationError => "generation_error",
            EventKind::IndexInvalidated => "index_invalidated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityEvent {
    pub article_id: ArticleId,
    pub kind: EventKind,
    /// Error kind as reported by `RagError::kind`
    pub error_kind: &'static str,
    pub attempts: u32,
    pub detail: String,
}

/// Receiver of pipeline failure events
pub trait Observer: Send + Sync {
    fn report(&self, event: ObservabilityEvent);
}

/// Writes every event as one structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn report(&self, event: ObservabilityEvent) {
        let line = format!(
            "event={} article_id={} error_kind={} attempts={} detail={:?}",
            event.kind.as_str(),
            event.article_id,
            event.error_kind,
            event.attempts,
            event.detail
        );
        match event.kind {
            EventKind::IngestionRetry => warn!("{}", line),
            EventKind::IndexInvalidated => info!("{}", line),
            _ => error!("{}", line),
        }
    }
}

/// Keeps events in memory; handy for tests and diagnostics endpoints
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl Observer for RecordingObserver {
    fn report(&self, event: ObservabilityEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
