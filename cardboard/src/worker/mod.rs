use crate::card::Card;
use crate::error::{EngineError, Result};
use crate::filter::FilterMap;
use crate::grouping::{self, Grouping};
use crate::query;
use crate::schema::{FieldDefinition, FieldId, ProjectId, QueryStrategy};
use crate::sort::SortRule;
use crate::store::CardStore;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Everything one recomputation reads, captured at request time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub project_id: ProjectId,
    /// Materialized cards; unused on the store path.
    pub cards: Vec<Card>,
    pub definitions: Vec<FieldDefinition>,
    pub search: String,
    pub filters: FilterMap,
    pub sort: Option<SortRule>,
    pub grouping_field: Option<FieldId>,
    pub strategy: QueryStrategy,
}

/// A finished recomputation: the ordered visible set and its buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputedView {
    pub generation: u64,
    pub cards: Vec<Card>,
    pub grouping: Grouping,
}

/// Run the full pipeline for one snapshot: search and filters, sort, then
/// grouping over the sorted result.
pub fn compute(snapshot: &Snapshot, store: Option<&dyn CardStore>) -> Result<ComputedView> {
    let cards = match (snapshot.strategy, store) {
        (QueryStrategy::Store, Some(store)) => query::run_store(
            store,
            snapshot.project_id,
            &snapshot.search,
            &snapshot.filters,
            snapshot.sort.as_ref(),
            &snapshot.definitions,
        )?,
        _ => query::run_in_memory(
            &snapshot.cards,
            &snapshot.search,
            &snapshot.filters,
            snapshot.sort.as_ref(),
            &snapshot.definitions,
        ),
    };

    let definition = snapshot
        .grouping_field
        .and_then(|id| snapshot.definitions.iter().find(|d| d.id == id));
    let grouping = match definition {
        Some(definition) => grouping::group_cards(definition, &cards),
        None => Grouping::default(),
    };

    Ok(ComputedView {
        generation: snapshot.generation,
        cards,
        grouping,
    })
}

#[derive(Debug, Default)]
struct SlotState {
    published: ComputedView,
    /// Newest generation that finished, successfully or not.
    settled: u64,
    last_error: Option<String>,
}

/// Shared between the orchestrator and its worker: the generation counter
/// and the last published result.
///
/// A result is published only if its generation is still the newest one
/// requested, so a slow computation can never overwrite a fresher result.
#[derive(Debug, Default)]
pub struct ResultSlot {
    requested: AtomicU64,
    state: Mutex<SlotState>,
    settled: Condvar,
    recomputes: AtomicUsize,
    /// Held across a store write and its save, and across every computation,
    /// so a computation never reads writes that may still be rolled back.
    store_gate: Mutex<()>,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the generation number for a new request.
    pub fn next_generation(&self) -> u64 {
        self.requested.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn is_latest(&self, generation: u64) -> bool {
        generation == self.requested()
    }

    pub fn published_generation(&self) -> u64 {
        self.state().published.generation
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn recompute_count(&self) -> usize {
        self.recomputes.load(Ordering::SeqCst)
    }

    pub(crate) fn count_recompute(&self) {
        self.recomputes.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn hold_store(&self) -> MutexGuard<'_, ()> {
        self.store_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the last published result.
    pub fn read<R>(&self, f: impl FnOnce(&ComputedView) -> R) -> R {
        f(&self.state().published)
    }

    /// Offer the outcome of computing `generation`. Returns whether it was
    /// accepted. A failed computation settles its generation but leaves the
    /// previous result in place.
    pub fn publish(&self, generation: u64, outcome: Result<ComputedView>) -> bool {
        let mut state = self.state();
        let latest = self.requested();
        if generation != latest || generation <= state.settled {
            log::debug!("Discarding stale result for generation {generation} (latest {latest})");
            return false;
        }

        state.settled = generation;
        match outcome {
            Ok(view) => {
                log::debug!(
                    "Published generation {generation}: {} visible cards, {} groups",
                    view.cards.len(),
                    view.grouping.keys.len()
                );
                state.published = view;
                state.last_error = None;
            }
            Err(e) => {
                log::warn!("Recomputation {generation} failed, keeping last result: {e}");
                state.last_error = Some(e.to_string());
            }
        }
        self.settled.notify_all();
        true
    }

    /// Block until the newest requested generation has settled or `timeout`
    /// passes. Returns whether it settled.
    pub fn wait_until_settled(&self, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .settled
            .wait_timeout_while(state, timeout, |s| s.settled < self.requested())
            .unwrap_or_else(PoisonError::into_inner);
        state.settled >= self.requested()
    }
}

enum Message {
    Recompute(Box<Snapshot>),
    Shutdown,
}

/// Background thread that coalesces recomputation requests.
///
/// Requests arriving within `debounce` of each other collapse into one
/// computation of the newest snapshot.
pub struct RecomputeWorker {
    tx: mpsc::Sender<Message>,
    thread: Option<JoinHandle<()>>,
}

impl RecomputeWorker {
    pub fn spawn(
        debounce: Duration,
        store: Option<Arc<dyn CardStore>>,
        slot: Arc<ResultSlot>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();

        let thread = std::thread::Builder::new()
            .name("cardboard-recompute".into())
            .spawn(move || {
                let mut pending: Option<Box<Snapshot>> = None;

                loop {
                    let received = match pending {
                        Some(_) => rx.recv_timeout(debounce),
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok(Message::Recompute(snapshot)) => {
                            // Newer snapshot replaces the waiting one
                            pending = Some(snapshot);
                        }
                        Ok(Message::Shutdown) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Some(snapshot) = pending.take() {
                                run_once(&snapshot, store.as_deref(), &slot);
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("Recompute worker stopped");
            })?;

        Ok(RecomputeWorker {
            tx,
            thread: Some(thread),
        })
    }

    /// Queue a snapshot. Cheap; never waits on a computation.
    pub fn schedule(&self, snapshot: Snapshot) -> Result<()> {
        log::debug!("Scheduling recomputation {}", snapshot.generation);
        self.tx
            .send(Message::Recompute(Box::new(snapshot)))
            .map_err(|_| EngineError::WorkerStopped)
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Recompute worker panicked");
            }
        }
    }
}

impl Drop for RecomputeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_once(snapshot: &Snapshot, store: Option<&dyn CardStore>, slot: &ResultSlot) {
    if !slot.is_latest(snapshot.generation) {
        log::debug!("Skipping superseded recomputation {}", snapshot.generation);
        return;
    }
    slot.count_recompute();
    let outcome = {
        let _gate = slot.hold_store();
        compute(snapshot, store)
    };
    slot.publish(snapshot.generation, outcome);
}
