use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::model::ProviderId;

/// Tracks one cancel flag per `(request, provider)` pair.
///
/// Cancellation is cooperative: `cancel` flips a watch flag that the
/// producer task driving that provider observes at its next suspension
/// point. Cancelling twice, or cancelling a pair that already reached a
/// terminal state (whose entry has been discarded), is a silent no-op.
#[derive(Default)]
pub struct CancelRegistry {
    entries: DashMap<(Uuid, ProviderId), watch::Sender<bool>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pair and returns the token its producer task observes.
    ///
    /// Re-registering an existing pair replaces the previous flag.
    pub fn register(&self, request_id: Uuid, provider: &ProviderId) -> CancelToken {
        let (tx, rx) = watch::channel(false);
        self.entries.insert((request_id, provider.clone()), tx);
        CancelToken { rx }
    }

    /// Requests cancellation of one provider's run. Idempotent.
    pub fn cancel(&self, request_id: Uuid, provider: &ProviderId) {
        if let Some(entry) = self.entries.get(&(request_id, provider.clone())) {
            debug!(request_id = %request_id, provider = %provider, "cancel requested");
            let _ = entry.send(true);
        }
    }

    /// Requests cancellation of every provider still active for a request.
    pub fn cancel_all(&self, request_id: Uuid) {
        for entry in self.entries.iter() {
            if entry.key().0 == request_id {
                debug!(request_id = %request_id, provider = %entry.key().1, "cancel-all requested");
                let _ = entry.value().send(true);
            }
        }
    }

    /// Drops the entry for a pair that reached a terminal state.
    ///
    /// A later `cancel` for the pair finds nothing and is a no-op, which is
    /// exactly the cancel-after-terminal race policy.
    pub(crate) fn discard(&self, request_id: Uuid, provider: &ProviderId) {
        self.entries.remove(&(request_id, provider.clone()));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Observer side of one cancel flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested.
    ///
    /// Never resolves if the registry entry is discarded without a cancel,
    /// so a `select!` against this arm simply stops being taken.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn already_cancelled() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_flips_the_registered_token() {
        let registry = CancelRegistry::new();
        let request_id = Uuid::new_v4();
        let provider = ProviderId::new("a");
        let token = registry.register(request_id, &provider);
        assert!(!token.is_cancelled());
        registry.cancel(request_id, &provider);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_twice_is_a_no_op() {
        let registry = CancelRegistry::new();
        let request_id = Uuid::new_v4();
        let provider = ProviderId::new("a");
        let mut token = registry.register(request_id, &provider);
        registry.cancel(request_id, &provider);
        registry.cancel(request_id, &provider);
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_after_discard_is_a_no_op() {
        let registry = CancelRegistry::new();
        let request_id = Uuid::new_v4();
        let provider = ProviderId::new("a");
        let token = registry.register(request_id, &provider);
        registry.discard(request_id, &provider);
        registry.cancel(request_id, &provider);
        assert!(!token.is_cancelled());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn cancel_all_only_touches_the_request() {
        let registry = CancelRegistry::new();
        let this = Uuid::new_v4();
        let other = Uuid::new_v4();
        let a = registry.register(this, &ProviderId::new("a"));
        let b = registry.register(this, &ProviderId::new("b"));
        let unrelated = registry.register(other, &ProviderId::new("a"));
        registry.cancel_all(this);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(!unrelated.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_survives_a_dropped_sender() {
        let mut token = CancelToken::already_cancelled();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
