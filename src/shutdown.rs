use tokio::sync::broadcast;

/// Listens for the stop signal of the owning server or client.
///
/// The signal travels over a `broadcast` channel: dropping the sender side
/// (or sending a single unit value) tells every subscribed worker to tear
/// down. A worker observes the request at the top of each tick; once seen
/// it stays seen.
pub(crate) struct Shutdown {
    /// `true` once the stop request was observed.
    is_shutdown: bool,

    /// Receiving half of the channel the request arrives on.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Wraps a `broadcast::Receiver` subscribed to the owner's channel.
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Whether the stop request has been observed.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Waits for the stop request, returning immediately if it was already
    /// observed.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // A closed channel counts the same as a received value: either
        // way, the owner is gone.
        let _ = self.notify.recv().await;

        self.is_shutdown = true;
    }
}
