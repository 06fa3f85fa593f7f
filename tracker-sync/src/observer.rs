//! Observer registry keyed by subscription tokens.
//!
//! Consumers subscribe and receive their own unbounded channel; teardown is
//! an explicit `unsubscribe(token)`. Observers whose receiver was dropped
//! are pruned on the next notify.

use std::collections::HashMap;

use tokio::sync::mpsc;

/// Handle returned by [`ObserverRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub struct ObserverRegistry<T> {
    next_token: u64,
    observers: HashMap<SubscriptionToken, mpsc::UnboundedSender<T>>,
}

impl<T: Clone> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            observers: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self) -> (SubscriptionToken, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_token += 1;
        let token = SubscriptionToken(self.next_token);
        self.observers.insert(token, tx);
        (token, rx)
    }

    /// Returns `false` if the token was unknown (already unsubscribed).
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        self.observers.remove(&token).is_some()
    }

    /// Deliver `item` to every live observer. Returns the delivery count.
    pub fn notify(&mut self, item: &T) -> usize {
        self.observers
            .retain(|_, tx| tx.send(item.clone()).is_ok());
        self.observers.len()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl<T: Clone> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
