use crate::{
    aggregate::AggregateDocument,
    error::QueueError,
    notify::{Notifier, notify_best_effort},
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Aggregate queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of queued documents before producers start shedding.
    pub capacity: usize,
    /// While overloaded, notify on the first drop and then every `notify_every` drops.
    pub notify_every: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            notify_every: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_notify_every(mut self, notify_every: u64) -> Self {
        self.notify_every = notify_every.max(1);
        self
    }
}

#[derive(Debug, Default)]
struct Shedding {
    dropped_total: AtomicU64,
    dropped_in_episode: AtomicU64,
}

/// Bounded, single consumer queue between the aggregators and the batch writer.
#[derive(Debug)]
pub struct AggregateQueue;

impl AggregateQueue {
    pub fn bounded(
        config: QueueConfig,
        notifier: Arc<dyn Notifier>,
    ) -> (QueueSender, QueueReceiver) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let shedding = Arc::new(Shedding::default());

        (
            QueueSender {
                tx,
                shedding,
                notifier,
                notify_every: config.notify_every.max(1),
            },
            QueueReceiver { rx },
        )
    }
}

/// Producer half. Never blocks: a full queue drops the document.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<AggregateDocument>,
    shedding: Arc<Shedding>,
    notifier: Arc<dyn Notifier>,
    notify_every: u64,
}

impl std::fmt::Debug for QueueSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSender")
            .field("depth", &self.depth())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl QueueSender {
    pub fn push(&self, document: AggregateDocument) -> Result<(), QueueError> {
        match self.tx.try_send(document) {
            Ok(()) => {
                self.shedding.dropped_in_episode.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(document)) => {
                let dropped = self.shedding.dropped_total.fetch_add(1, Ordering::Relaxed) + 1;
                let in_episode = self
                    .shedding
                    .dropped_in_episode
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;

                if in_episode == 1 || in_episode % self.notify_every == 0 {
                    warn!(
                        instrument = %document.instrument_key(),
                        dropped,
                        in_episode,
                        "aggregate queue full, shedding documents"
                    );
                    self.raise_overload(in_episode);
                }

                Err(QueueError::Overloaded { dropped })
            }
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    fn raise_overload(&self, in_episode: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let notifier = Arc::clone(&self.notifier);
        let capacity = self.tx.max_capacity();
        runtime.spawn(async move {
            let text = format!(
                "[Queue] Overloaded: queue full at {capacity} documents, {in_episode} dropped so far"
            );
            notify_best_effort(notifier.as_ref(), &text).await;
        });
    }

    /// Number of documents currently queued.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Total documents dropped by load shedding since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.shedding.dropped_total.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the [`BatchWriter`](super::writer::BatchWriter).
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<AggregateDocument>,
}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<AggregateDocument> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AggregateDocument> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingNotifier, volume_document};

    #[tokio::test]
    async fn test_queue_sender_push_sheds_when_full() {
        let notifier = Arc::new(RecordingNotifier::default());
        let config = QueueConfig::default()
            .with_capacity(2)
            .with_notify_every(3);
        let (tx, mut rx) = AggregateQueue::bounded(config, notifier.clone());

        assert_eq!(tx.push(volume_document("A", 0)), Ok(()));
        assert_eq!(tx.push(volume_document("A", 1)), Ok(()));
        assert_eq!(tx.depth(), 2);

        for expected in 1..=4 {
            assert_eq!(
                tx.push(volume_document("A", 2)),
                Err(QueueError::Overloaded { dropped: expected })
            );
        }
        assert_eq!(tx.dropped(), 4);

        // Queued documents are untouched by shedding
        assert_eq!(rx.len(), 2);
        assert!(rx.try_recv().is_some());

        // Let the spawned notifications run: first drop and the 3rd drop of the episode
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let messages = notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|text| text.contains(" 1 dropped")));
        assert!(messages.iter().any(|text| text.contains(" 3 dropped")));
    }

    #[tokio::test]
    async fn test_queue_sender_push_after_receiver_dropped() {
        let (tx, rx) = AggregateQueue::bounded(
            QueueConfig::default(),
            Arc::new(RecordingNotifier::default()),
        );
        drop(rx);

        assert_eq!(tx.push(volume_document("A", 0)), Err(QueueError::Closed));
    }
}
