//! Wait/resume broker
//!
//! Correlates asynchronous completions with the node waiting for them.
//! Producers call [`WaitBroker::done_with`] with a correlation id; a
//! consumer registers one callback over a set of ids with
//! [`WaitBroker::wait_for_all_on`] and is called once every id has been
//! delivered.
//!
//! Delivery rules:
//! - each wait fires at most once
//! - a completion that arrives before its wait is retained and handed
//!   over when the wait registers
//! - a second completion for the same id is ignored
//! - a completion for an id whose wait was cancelled is dropped
//!
//! Delivered and cancelled ids are remembered up to
//! `broker.max_settled_ids`; past that the oldest are forgotten.
//!
//! Callbacks run on the worker, never under the broker lock.

use async_trait::async_trait;
use parking_lot::Mutex;
use plan_types::ResponseData;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::state::ResponseMap;
use crate::worker::Worker;
use crate::BrokerConfig;

/// Identifier of one registered wait
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WaitId(pub String);

impl WaitId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for WaitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consumer side of a wait
#[async_trait]
pub trait WaitCallback: Send + Sync {
    async fn on_done(&self, responses: ResponseMap);
}

struct PendingWait {
    owner: String,
    correlation_ids: Vec<String>,
    remaining: HashSet<String>,
    callback: Arc<dyn WaitCallback>,
}

struct ReadyWait {
    wait_id: WaitId,
    owner: String,
    callback: Arc<dyn WaitCallback>,
    responses: ResponseMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settlement {
    Delivered,
    Cancelled,
}

/// Correlation ids that must not be delivered again, oldest evicted first
struct SettledIds {
    capacity: usize,
    entries: HashMap<String, Settlement>,
    order: VecDeque<String>,
}

impl SettledIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, correlation_id: &str) -> Option<Settlement> {
        self.entries.get(correlation_id).copied()
    }

    /// Record `correlation_id` unless it is already settled
    fn settle(&mut self, correlation_id: &str, settlement: Settlement) {
        if self.entries.contains_key(correlation_id) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(correlation_id.to_string(), settlement);
        self.order.push_back(correlation_id.to_string());
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct BrokerState {
    /// Delivered responses not yet handed to a wait
    retained: HashMap<String, ResponseData>,
    settled: SettledIds,
    waits: HashMap<WaitId, PendingWait>,
    by_correlation: HashMap<String, WaitId>,
    by_owner: HashMap<String, Vec<WaitId>>,
    timers: HashMap<String, JoinHandle<()>>,
}

impl BrokerState {
    fn new(config: &BrokerConfig) -> Self {
        Self {
            retained: HashMap::new(),
            settled: SettledIds::new(config.max_settled_ids),
            waits: HashMap::new(),
            by_correlation: HashMap::new(),
            by_owner: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    fn remove_wait(&mut self, wait_id: &WaitId) -> Option<PendingWait> {
        let wait = self.waits.remove(wait_id)?;
        if let Some(ids) = self.by_owner.get_mut(&wait.owner) {
            ids.retain(|id| id != wait_id);
            if ids.is_empty() {
                self.by_owner.remove(&wait.owner);
            }
        }
        for correlation_id in &wait.correlation_ids {
            self.by_correlation.remove(correlation_id);
        }
        Some(wait)
    }

    fn collect(&mut self, wait_id: WaitId, wait: PendingWait) -> ReadyWait {
        let responses = wait
            .correlation_ids
            .iter()
            .filter_map(|id| self.retained.remove(id).map(|data| (id.clone(), data)))
            .collect();
        ReadyWait {
            wait_id,
            owner: wait.owner,
            callback: wait.callback,
            responses,
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    worker: Worker,
    config: BrokerConfig,
}

/// In-process wait/resume broker
#[derive(Clone)]
pub struct WaitBroker {
    inner: Arc<BrokerInner>,
}

impl WaitBroker {
    pub fn new(worker: Worker, config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::new(&config)),
                worker,
                config,
            }),
        }
    }

    /// Deliver the completion for `correlation_id`.
    ///
    /// Returns `false` if the delivery was ignored as a duplicate, arrived
    /// after its wait was cancelled, or could not be retained.
    pub fn done_with(&self, correlation_id: &str, data: ResponseData) -> bool {
        let ready = {
            let mut state = self.inner.state.lock();
            match state.settled.get(correlation_id) {
                Some(Settlement::Delivered) => {
                    tracing::warn!(correlation_id, "Duplicate completion ignored");
                    return false;
                }
                Some(Settlement::Cancelled) => {
                    tracing::warn!(correlation_id, "Completion for a cancelled wait dropped");
                    return false;
                }
                None => {}
            }
            state.timers.remove(correlation_id);

            match state.by_correlation.get(correlation_id).cloned() {
                Some(wait_id) => {
                    state.settled.settle(correlation_id, Settlement::Delivered);
                    state.retained.insert(correlation_id.to_string(), data);
                    let complete = match state.waits.get_mut(&wait_id) {
                        Some(wait) => {
                            wait.remaining.remove(correlation_id);
                            wait.remaining.is_empty()
                        }
                        None => false,
                    };
                    if complete {
                        state
                            .remove_wait(&wait_id)
                            .map(|wait| state.collect(wait_id, wait))
                    } else {
                        None
                    }
                }
                None => {
                    let config = &self.inner.config;
                    if !config.retain_early_responses
                        || state.retained.len() >= config.max_retained_responses
                    {
                        tracing::warn!(correlation_id, "No wait registered; completion dropped");
                        return false;
                    }
                    state.settled.settle(correlation_id, Settlement::Delivered);
                    tracing::debug!(correlation_id, "No wait registered yet; completion retained");
                    state.retained.insert(correlation_id.to_string(), data);
                    None
                }
            }
        };

        if let Some(ready) = ready {
            self.fire(ready);
        }
        true
    }

    /// Call `callback` once every id in `correlation_ids` is delivered.
    ///
    /// `owner` groups waits for [`WaitBroker::cancel_waits`]. An empty id
    /// list fires immediately with no responses.
    pub fn wait_for_all_on(
        &self,
        owner: &str,
        correlation_ids: Vec<String>,
        callback: Arc<dyn WaitCallback>,
    ) -> WaitId {
        let wait_id = WaitId::generate();
        let ready = {
            let mut state = self.inner.state.lock();
            let remaining: HashSet<String> = correlation_ids
                .iter()
                .filter(|id| !state.retained.contains_key(*id))
                .cloned()
                .collect();

            let wait = PendingWait {
                owner: owner.to_string(),
                correlation_ids,
                remaining,
                callback,
            };

            if wait.remaining.is_empty() {
                Some(state.collect(wait_id.clone(), wait))
            } else {
                for correlation_id in &wait.remaining {
                    if let Some(previous) = state
                        .by_correlation
                        .insert(correlation_id.clone(), wait_id.clone())
                    {
                        tracing::warn!(
                            correlation_id = %correlation_id,
                            previous_wait = %previous,
                            "Correlation id already awaited; new wait takes over"
                        );
                    }
                }
                tracing::debug!(
                    wait_id = %wait_id,
                    owner,
                    pending = wait.remaining.len(),
                    "Wait registered"
                );
                state
                    .by_owner
                    .entry(wait.owner.clone())
                    .or_default()
                    .push(wait_id.clone());
                state.waits.insert(wait_id.clone(), wait);
                None
            }
        };

        if let Some(ready) = ready {
            self.fire(ready);
        }
        wait_id
    }

    /// Call `callback` after `duration`, with an `Elapsed` response
    pub fn delay(&self, owner: &str, duration: Duration, callback: Arc<dyn WaitCallback>) -> WaitId {
        let correlation_id = format!("delay-{}", uuid::Uuid::new_v4());
        let wait_id = self.wait_for_all_on(owner, vec![correlation_id.clone()], callback);

        // The timer task cannot deliver before the handle is recorded: it
        // needs the lock held here.
        let mut state = self.inner.state.lock();
        let broker = self.clone();
        let timer_id = correlation_id.clone();
        let handle = self
            .inner
            .worker
            .submit_after(duration, "broker.delay", async move {
                broker.done_with(&timer_id, ResponseData::Elapsed);
            });
        state.timers.insert(correlation_id, handle);
        wait_id
    }

    /// Drop every wait registered by `owner`, stopping their timers.
    /// Returns how many waits were cancelled.
    pub fn cancel_waits(&self, owner: &str) -> usize {
        let mut state = self.inner.state.lock();
        let wait_ids = state.by_owner.remove(owner).unwrap_or_default();
        let mut cancelled = 0;
        for wait_id in wait_ids {
            if let Some(wait) = state.remove_wait(&wait_id) {
                for correlation_id in &wait.correlation_ids {
                    state.settled.settle(correlation_id, Settlement::Cancelled);
                    state.retained.remove(correlation_id);
                    if let Some(timer) = state.timers.remove(correlation_id) {
                        timer.abort();
                    }
                }
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(owner, cancelled, "Waits cancelled");
        }
        cancelled
    }

    pub fn pending_waits(&self) -> usize {
        self.inner.state.lock().waits.len()
    }

    pub fn retained_responses(&self) -> usize {
        self.inner.state.lock().retained.len()
    }

    /// Correlation ids currently remembered as delivered or cancelled
    pub fn settled_ids(&self) -> usize {
        self.inner.state.lock().settled.len()
    }

    pub fn is_waiting_on(&self, correlation_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .by_correlation
            .contains_key(correlation_id)
    }

    fn fire(&self, ready: ReadyWait) {
        tracing::debug!(
            wait_id = %ready.wait_id,
            owner = %ready.owner,
            responses = ready.responses.len(),
            "Wait complete"
        );
        let callback = ready.callback;
        let responses = ready.responses;
        self.inner.worker.submit("broker.callback", async move {
            callback.on_done(responses).await;
        });
    }
}
