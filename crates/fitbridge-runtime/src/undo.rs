//! Undo chain
//!
//! Actions registered while the service starts up (for example switching the
//! radio on) push the async step that reverts them. Shutdown awaits the chain
//! in reverse registration order before the transport and database close.

use futures::future::BoxFuture;
use tracing::debug;

struct PreAction {
    name: String,
    revert: BoxFuture<'static, ()>,
}

#[derive(Default)]
pub struct UndoChain {
    actions: Vec<PreAction>,
}

impl UndoChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step reverting an action that just took effect
    pub fn push<F>(&mut self, name: impl Into<String>, revert: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.actions.push(PreAction {
            name: name.into(),
            revert: Box::pin(revert),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Await every registered step, last first; returns how many ran
    pub async fn run(&mut self) -> usize {
        let mut ran = 0;
        while let Some(action) = self.actions.pop() {
            debug!("Undoing {}", action.name);
            action.revert.await;
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_steps_run_last_first_and_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut chain = UndoChain::new();
        for name in ["radio", "scan mode"] {
            let order = order.clone();
            chain.push(name, async move {
                order.lock().unwrap().push(name);
            });
        }
        assert_eq!(chain.len(), 2);

        assert_eq!(chain.run().await, 2);
        assert_eq!(*order.lock().unwrap(), vec!["scan mode", "radio"]);
        assert!(chain.is_empty());
        assert_eq!(chain.run().await, 0);
    }
}
