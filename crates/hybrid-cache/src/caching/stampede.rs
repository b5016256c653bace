//! Deduplication of concurrent fills.
//!
//! Every fill is represented by a [`StampedeState`] which lives in the [`StampedeRegistry`] while
//! the fill is running. Concurrent operations on the same [`StampedeKey`] find that state and
//! subscribe to its result instead of starting a fill of their own.
//!
//! A fill is shared between all of its callers, and it only stops early when *every* caller
//! has given up on it. The state keeps a count of its callers for that purpose, and cancels the
//! fill once that count drops to zero. A state that is complete or cancelled never accepts new
//! callers; those start a fresh fill, which replaces the old state in the registry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{CacheResult, HybridCacheError, StampedeKey};
use crate::utils::defer::defer;

/// The receiving end of a fill, which can be polled by any number of callers.
type FillChannel<T> = Shared<oneshot::Receiver<CacheResult<T>>>;

/// A type-erased [`StampedeState`], as stored in the [`StampedeRegistry`].
pub(crate) trait Stampede: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Debug, Default)]
struct Callers {
    count: usize,
    complete: bool,
}

/// The shared state of a single in-flight fill.
pub(crate) struct StampedeState<T> {
    key: StampedeKey,
    channel: FillChannel<T>,
    /// Cancelled once the last caller is gone. The fill and the factory observe this.
    token: CancellationToken,
    callers: Mutex<Callers>,
}

impl<T> fmt::Debug for StampedeState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callers = self.callers.lock();
        f.debug_struct("StampedeState")
            .field("key", &self.key)
            .field("callers", &callers.count)
            .field("complete", &callers.complete)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl<T> StampedeState<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new state with a single caller, the one starting the fill.
    fn new(key: StampedeKey) -> (Arc<Self>, oneshot::Sender<CacheResult<T>>) {
        let (sender, receiver) = oneshot::channel();
        let state = Self {
            key,
            channel: receiver.shared(),
            token: CancellationToken::new(),
            callers: Mutex::new(Callers {
                count: 1,
                complete: false,
            }),
        };
        (Arc::new(state), sender)
    }

    /// Creates a state that is not tracked by any registry.
    ///
    /// This is used for fills which must not be shared, like explicit writes.
    pub fn unregistered(key: StampedeKey) -> (Arc<Self>, oneshot::Sender<CacheResult<T>>) {
        Self::new(key)
    }

    /// The token that is cancelled once all callers have given up on this fill.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Registers one more caller, unless this fill can no longer be joined.
    fn try_add_caller(&self) -> bool {
        let mut callers = self.callers.lock();
        if callers.complete || self.token.is_cancelled() {
            return false;
        }
        callers.count += 1;
        true
    }

    /// Unregisters a caller, cancelling the fill if it was the last one.
    fn remove_caller(&self) {
        let mut callers = self.callers.lock();
        callers.count = callers.count.saturating_sub(1);
        if callers.count == 0 && !callers.complete {
            tracing::trace!(key = %self.key, "all callers gone, cancelling fill");
            self.token.cancel();
        }
    }

    fn mark_complete(&self) {
        self.callers.lock().complete = true;
    }

    /// Drives `fill` to completion and publishes its result to all callers.
    ///
    /// The state is removed from `registry` *before* the result is published. Callers which
    /// arrive later therefore either find the fresh cache entry or start a new fill. The
    /// removal also happens when this future is dropped or the fill panics.
    pub async fn run<F>(
        self: Arc<Self>,
        registry: Arc<StampedeRegistry>,
        sender: oneshot::Sender<CacheResult<T>>,
        fill: F,
    ) where
        F: Future<Output = CacheResult<T>>,
    {
        let unregister = defer({
            let state = self.clone();
            move || registry.remove(&state)
        });

        let result = tokio::select! {
            biased;
            result = fill => result,
            _ = self.token.cancelled() => Err(HybridCacheError::Cancelled),
        };

        drop(unregister);
        self.mark_complete();
        sender.send(result).ok();
    }

    /// Waits for the result of this fill on behalf of one caller.
    ///
    /// The caller is unregistered when this returns or is dropped. Cancelling `token` only
    /// affects this caller, other callers still get the result.
    pub async fn wait(&self, token: Option<&CancellationToken>) -> CacheResult<T> {
        let _caller = defer(|| self.remove_caller());
        let channel = self.channel.clone();

        let result = match token {
            Some(token) => tokio::select! {
                biased;
                result = channel => result,
                _ = token.cancelled() => return Err(HybridCacheError::Cancelled),
            },
            None => channel.await,
        };

        // The sender is gone without publishing a result, which only happens if the fill was
        // dropped by its owner.
        result.unwrap_or(Err(HybridCacheError::Cancelled))
    }
}

impl<T> Stampede for StampedeState<T>
where
    T: Send + Sync + 'static,
{
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The outcome of [`StampedeRegistry::register`].
pub(crate) enum Registration<T> {
    /// No joinable fill existed. The caller has to run the fill and publish through `sender`.
    Owner {
        state: Arc<StampedeState<T>>,
        sender: oneshot::Sender<CacheResult<T>>,
    },
    /// The caller was added to a running fill.
    Joined(Arc<StampedeState<T>>),
}

/// The set of currently running fills.
#[derive(Default)]
pub(crate) struct StampedeRegistry {
    states: Mutex<HashMap<StampedeKey, Arc<dyn Stampede>>>,
}

impl fmt::Debug for StampedeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StampedeRegistry")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl StampedeRegistry {
    /// Joins the running fill for `key`, or registers a new one.
    ///
    /// A fill which is complete or cancelled is replaced. If a fill of a *different value type*
    /// is running under the same key, a new fill is started without registering it, so that
    /// it does not displace the other one.
    pub fn register<T>(&self, key: StampedeKey) -> Registration<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut states = self.states.lock();

        if let Some(existing) = states.get(&key) {
            match existing.clone().into_any().downcast::<StampedeState<T>>() {
                Ok(state) => {
                    if state.try_add_caller() {
                        return Registration::Joined(state);
                    }
                }
                Err(_) => {
                    tracing::debug!(%key, "fill with a different value type in flight");
                    let (state, sender) = StampedeState::new(key);
                    return Registration::Owner { state, sender };
                }
            }
        }

        let (state, sender) = StampedeState::new(key.clone());
        states.insert(key, state.clone());
        Registration::Owner { state, sender }
    }

    /// Removes `state`, but only if it is still the registered state for its key.
    pub fn remove<T>(&self, state: &Arc<StampedeState<T>>)
    where
        T: Send + Sync + 'static,
    {
        let mut states = self.states.lock();
        let is_current = states
            .get(&state.key)
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(state)));
        if is_current {
            states.remove(&state.key);
        }
    }

    /// The number of fills currently in flight.
    pub fn len(&self) -> usize {
        self.states.lock().len()
    }
}
