use crate::id::EntityId;
use fnv::{FnvHashMap, FnvHashSet};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

/// What a read or write touched: the entity itself (field-level access) or
/// one of its container fields (sub-key access).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Target {
    pub entity: EntityId,
    pub field: Option<Arc<str>>,
}

impl Target {
    pub(crate) fn entity(id: EntityId) -> Self {
        Self {
            entity: id,
            field: None,
        }
    }

    pub(crate) fn field(id: EntityId, field: Arc<str>) -> Self {
        Self {
            entity: id,
            field: Some(field),
        }
    }
}

/// A tracked sub-key: a named field or record key, an array index, the
/// whole container, or its membership.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Key {
    Field(Arc<str>),
    Index(u32),
    All,
    Indices,
}

fn wakes(reads: &FnvHashSet<Key>, modified: &Key) -> bool {
    match modified {
        Key::All => !reads.is_empty(),
        Key::Indices => reads.contains(&Key::Indices) || reads.contains(&Key::All),
        key => reads.contains(key) || reads.contains(&Key::All),
    }
}

type ReadSet = FnvHashMap<Target, FnvHashSet<Key>>;

struct Collector {
    id: u64,
    reads: ReadSet,
}

struct Armed {
    reads: ReadSet,
    on_change: Arc<dyn Fn()>,
}

enum Pending {
    Wake(u64, Arc<dyn Fn()>),
    Hook(Target, Key),
}

#[derive(Default)]
struct State {
    next_id: u64,
    collectors: SmallVec<[Collector; 2]>,
    armed: FnvHashMap<u64, Armed>,
    queue: Vec<Pending>,
    queued: FnvHashSet<u64>,
    suppress: bool,
    defer: bool,
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State::default());
}

struct Hooks {
    on_access: Box<dyn Fn(&Target, &Key) + Send + Sync>,
    on_modify: Box<dyn Fn(&Target, &Key) + Send + Sync>,
}

static HOOKS: OnceLock<Hooks> = OnceLock::new();

/// Registers the process-wide access/modification hooks used by external
/// reactive adapters. May be called once.
pub fn set_hooks(
    on_access: impl Fn(&Target, &Key) + Send + Sync + 'static,
    on_modify: impl Fn(&Target, &Key) + Send + Sync + 'static,
) -> crate::Result<()> {
    HOOKS
        .set(Hooks {
            on_access: Box::new(on_access),
            on_modify: Box::new(on_modify),
        })
        .map_err(|_| crate::Error::AlreadyRegistered("tracking hooks".into()))
}

/// A single-shot change observer over the reads of a closure. Re-run
/// [`TrackedReader::read`] after each wake to collect a fresh read set;
/// dropping the reader cancels it.
pub struct TrackedReader {
    id: u64,
    on_change: Arc<dyn Fn()>,
}

impl TrackedReader {
    pub fn new(on_change: impl Fn() + 'static) -> Self {
        let id = STATE.with(|state| {
            let mut state = state.borrow_mut();
            state.next_id += 1;
            state.next_id
        });
        Self {
            id,
            on_change: Arc::new(on_change),
        }
    }

    /// Runs `reader` collecting its read set, then arms this reader; a
    /// re-read within a transaction replaces the previous read set rather
    /// than duplicating the wake.
    pub fn read<R>(&self, reader: impl FnOnce() -> R) -> R {
        struct Guard {
            id: u64,
            on_change: Arc<dyn Fn()>,
        }
        impl Drop for Guard {
            fn drop(&mut self) {
                STATE.with(|state| {
                    let mut state = state.borrow_mut();
                    let collector = state
                        .collectors
                        .pop()
                        .expect("collector stack out of balance");
                    debug_assert_eq!(collector.id, self.id);
                    if collector.reads.is_empty() {
                        state.armed.remove(&self.id);
                    } else {
                        state.armed.insert(
                            self.id,
                            Armed {
                                reads: collector.reads,
                                on_change: self.on_change.clone(),
                            },
                        );
                    }
                });
            }
        }

        STATE.with(|state| {
            state.borrow_mut().collectors.push(Collector {
                id: self.id,
                reads: ReadSet::default(),
            })
        });
        let guard = Guard {
            id: self.id,
            on_change: self.on_change.clone(),
        };
        let value = reader();
        drop(guard);
        value
    }

    /// Whether a modification can still wake this reader.
    pub fn is_armed(&self) -> bool {
        STATE.with(|state| state.borrow().armed.contains_key(&self.id))
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        STATE.with(|state| {
            state.borrow_mut().armed.remove(&self.id);
        });
    }
}

/// Runs `reader` and returns its value together with the armed reader.
pub fn tracked_read<R>(
    on_change: impl Fn() + 'static,
    reader: impl FnOnce() -> R,
) -> (R, TrackedReader) {
    let tracked = TrackedReader::new(on_change);
    let value = tracked.read(reader);
    (value, tracked)
}

/// Runs `f` with modification reporting disabled. Accesses are still
/// collected.
pub fn suppress_tracking<R>(f: impl FnOnce() -> R) -> R {
    let previous = STATE.with(|state| {
        let mut state = state.borrow_mut();
        std::mem::replace(&mut state.suppress, true)
    });
    struct Guard(bool);
    impl Drop for Guard {
        fn drop(&mut self) {
            STATE.with(|state| state.borrow_mut().suppress = self.0);
        }
    }
    let _guard = Guard(previous);
    f()
}

pub(crate) fn report_access(target: &Target, key: &Key) {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        for collector in state.collectors.iter_mut() {
            collector
                .reads
                .entry(target.clone())
                .or_default()
                .insert(key.clone());
        }
    });
    if let Some(hooks) = HOOKS.get() {
        (hooks.on_access)(target, key);
    }
}

pub(crate) fn report_modify(target: &Target, key: &Key) {
    let drain_now = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.suppress {
            return false;
        }
        let woken: Vec<u64> = state
            .armed
            .iter()
            .filter(|(_, armed)| {
                armed
                    .reads
                    .get(target)
                    .map(|keys| wakes(keys, key))
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in woken {
            let armed = state.armed.remove(&id).expect("woken reader is armed");
            if state.queued.insert(id) {
                state.queue.push(Pending::Wake(id, armed.on_change));
            }
        }
        if HOOKS.get().is_some() {
            state.queue.push(Pending::Hook(target.clone(), key.clone()));
        }
        !state.defer && !crate::txn::in_transaction()
    });
    if drain_now {
        drain();
    }
}

/// Holds queued notifications while `f` runs; used by the substrate
/// observer, which fires mid-commit where user callbacks must not touch
/// the document. The caller drains once the commit is over.
pub(crate) fn defer_notifications<R>(f: impl FnOnce() -> R) -> R {
    let previous = STATE.with(|state| {
        let mut state = state.borrow_mut();
        std::mem::replace(&mut state.defer, true)
    });
    struct Guard(bool);
    impl Drop for Guard {
        fn drop(&mut self) {
            STATE.with(|state| state.borrow_mut().defer = self.0);
        }
    }
    let _guard = Guard(previous);
    f()
}

/// Drains the notification queue. Callback failures are logged and do not
/// stop the drain.
pub(crate) fn drain() {
    loop {
        let batch = STATE.with(|state| std::mem::take(&mut state.borrow_mut().queue));
        if batch.is_empty() {
            return;
        }
        for pending in batch {
            match pending {
                Pending::Wake(id, on_change) => {
                    STATE.with(|state| state.borrow_mut().queued.remove(&id));
                    if catch_unwind(AssertUnwindSafe(|| on_change())).is_err() {
                        tracing::error!("tracked reader callback panicked");
                    }
                }
                Pending::Hook(target, key) => {
                    if let Some(hooks) = HOOKS.get() {
                        if catch_unwind(AssertUnwindSafe(|| (hooks.on_modify)(&target, &key)))
                            .is_err()
                        {
                            tracing::error!("modification hook panicked");
                        }
                    }
                }
            }
        }
    }
}

/// Discards queued notifications after an aborted transaction.
pub(crate) fn clear_queue() {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.queue.clear();
        state.queued.clear();
    });
}
