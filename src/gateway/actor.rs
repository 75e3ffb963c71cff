//! Single-instance state per key.
//!
//! Every key owns one `tokio::sync::Mutex`; operations addressed to the same key run one at a
//! time while different keys proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

pub struct KeyedActors<S> {
    actors: Mutex<HashMap<String, Arc<Mutex<S>>>>,
}

impl<S> Default for KeyedActors<S> {
    fn default() -> Self {
        Self {
            actors: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Default + Send> KeyedActors<S> {
    async fn actor(&self, name: &str) -> Arc<Mutex<S>> {
        let mut actors = self.actors.lock().await;
        actors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(S::default())))
            .clone()
    }

    /// Runs `op` with exclusive access to the state named `name`, creating it on first use.
    pub async fn with<R>(&self, name: &str, op: impl FnOnce(&mut S) -> R) -> R {
        let actor = self.actor(name).await;
        let mut state = actor.lock().await;
        op(&mut state)
    }

    pub async fn len(&self) -> usize {
        self.actors.lock().await.len()
    }

    /// Drops states that nobody holds and that `idle` reports as disposable. A state in use
    /// by a concurrent `with` is always kept. Returns the number of states removed.
    pub async fn prune(&self, idle: impl Fn(&S) -> bool) -> usize {
        let mut actors = self.actors.lock().await;
        let before = actors.len();
        actors.retain(|_, actor| {
            if Arc::strong_count(actor) > 1 {
                return true;
            }
            match actor.try_lock() {
                Ok(state) => !idle(&*state),
                Err(_) => true,
            }
        });
        before - actors.len()
    }
}

/// Stable actor name for a scope (`"rl"`, `"wallet"`) and an id.
pub fn actor_name(scope: &str, id: &str) -> String {
    format!("{scope}:{id}")
}
