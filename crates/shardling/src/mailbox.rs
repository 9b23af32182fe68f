use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Create an unbounded FIFO mailbox.
///
/// The sender half is cheaply cloneable; the receiver half is owned by the
/// consuming task. Shutting the mailbox down wakes any pending `take` with
/// the drained signal (`None`) and makes subsequent offers fail.
pub fn mailbox<T>() -> (MailboxSender<T>, Mailbox<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    (
        MailboxSender {
            tx,
            shutdown: shutdown.clone(),
        },
        Mailbox { rx, shutdown },
    )
}

/// Producer half of an entity mailbox.
pub struct MailboxSender<T> {
    tx: mpsc::UnboundedSender<T>,
    shutdown: CancellationToken,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    /// Enqueue an item. Returns the item back when the mailbox has shut
    /// down, so the caller can retry against a freshly resolved entity.
    pub fn offer(&self, item: T) -> Result<(), T> {
        if self.shutdown.is_cancelled() {
            return Err(item);
        }
        self.tx.send(item).map_err(|rejected| rejected.0)
    }

    /// Shut the mailbox down: pending and future `take`s observe the
    /// drained signal, and offers start failing.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Consumer half of an entity mailbox. FIFO, single-consumer.
pub struct Mailbox<T> {
    rx: mpsc::UnboundedReceiver<T>,
    shutdown: CancellationToken,
}

impl<T> Mailbox<T> {
    /// Wait for the next item. `None` means the mailbox was shut down;
    /// items enqueued but undelivered at that point are dropped (durable
    /// copies remain in storage for replay).
    pub async fn take(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Non-blocking variant of [`take`](Self::take).
    pub fn try_take(&mut self) -> Option<T> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}
