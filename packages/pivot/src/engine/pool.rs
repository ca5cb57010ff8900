//! Stage pool and the update task that drives recomputation cycles.
//!
//! A cycle runs `Idle -> Running -> Idle`. The shared "data remaining"
//! signal decides whether the cycle processes stages or passes straight
//! through; either way the epoch advances once and observers hear about it.

use crate::error::{PivotError, Result};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

pub type StageId = usize;
pub type Epoch = u64;
pub type ObserverId = u64;

/// "Data remaining" flag shared between producers and the cycle runner.
#[derive(Debug, Clone, Default)]
pub struct DataSignal(Arc<AtomicBool>);

impl DataSignal {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag, returning whether it was set.
    #[inline]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// A pipeline stage owned by the pool.
pub trait Stage: Any + Send {
    fn name(&self) -> &str;

    /// Consumes pending input and produces this cycle's output.
    fn process(&mut self) -> anyhow::Result<()>;

    /// Releases output produced by the last `process`.
    fn clear_output_ports(&mut self);

    fn has_pending(&self) -> bool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Epoch reached by this cycle.
    pub epoch: Epoch,
    pub processed_stages: usize,
    pub elapsed: Duration,
    /// False for pass-through cycles.
    pub did_work: bool,
}

/// Observability hook around cycle boundaries.
pub trait CycleHook: Send + Sync {
    fn on_cycle_start(&self, _epoch: Epoch) {}

    fn on_cycle_end(&self, stats: &CycleStats);
}

type Observer = Arc<dyn Fn(Epoch) + Send + Sync>;

pub struct Pool {
    stages: Mutex<IndexMap<StageId, Box<dyn Stage>>>,
    next_stage: AtomicUsize,
    signal: DataSignal,
    epoch: AtomicU64,
    running: AtomicBool,
    observers: Mutex<IndexMap<ObserverId, Observer>>,
    next_observer: AtomicU64,
    hook: Option<Arc<dyn CycleHook>>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("epoch", &self.epoch())
            .field("data_remaining", &self.signal.is_set())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            stages: Mutex::new(IndexMap::new()),
            next_stage: AtomicUsize::new(0),
            signal: DataSignal::new(),
            epoch: AtomicU64::new(0),
            running: AtomicBool::new(false),
            observers: Mutex::new(IndexMap::new()),
            next_observer: AtomicU64::new(0),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CycleHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    // --- Stages ---

    /// Registers a stage at the end of the processing order.
    pub fn register_stage(&self, stage: Box<dyn Stage>) -> Result<StageId> {
        let id = self.next_stage.fetch_add(1, Ordering::Relaxed);
        debug!(id, name = stage.name(), "stage registered");
        self.lock_stages()?.insert(id, stage);
        Ok(id)
    }

    pub fn register<S: Stage>(&self, stage: S) -> Result<StageId> {
        self.register_stage(Box::new(stage))
    }

    /// Removes a stage, keeping the order of the others.
    pub fn unregister_stage(&self, id: StageId) -> Result<Box<dyn Stage>> {
        self.lock_stages()?
            .shift_remove(&id)
            .ok_or(PivotError::UnknownStage(id))
    }

    pub fn stage_ids(&self) -> Result<Vec<StageId>> {
        Ok(self.lock_stages()?.keys().copied().collect())
    }

    /// Runs `f` against a registered stage of concrete type `S`.
    pub fn with_stage<S: Stage, R>(&self, id: StageId, f: impl FnOnce(&S) -> R) -> Result<R> {
        let stages = self.lock_stages()?;
        let stage = stages.get(&id).ok_or(PivotError::UnknownStage(id))?;
        let typed = stage
            .as_any()
            .downcast_ref::<S>()
            .ok_or(PivotError::StageType(id))?;
        Ok(f(typed))
    }

    pub fn with_stage_mut<S: Stage, R>(&self, id: StageId, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        let mut stages = self.lock_stages()?;
        let stage = stages.get_mut(&id).ok_or(PivotError::UnknownStage(id))?;
        let typed = stage
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or(PivotError::StageType(id))?;
        Ok(f(typed))
    }

    fn lock_stages(&self) -> Result<std::sync::MutexGuard<'_, IndexMap<StageId, Box<dyn Stage>>>> {
        self.stages.lock().map_err(|_| PivotError::Poisoned("pool stages"))
    }

    // --- Signal / epoch ---

    /// Handle producers use to flag pending input.
    pub fn signal(&self) -> DataSignal {
        self.signal.clone()
    }

    pub fn mark_data_remaining(&self) {
        self.signal.mark();
    }

    pub fn has_data_remaining(&self) -> bool {
        self.signal.is_set()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CycleState {
        if self.running.load(Ordering::Acquire) {
            CycleState::Running
        } else {
            CycleState::Idle
        }
    }

    // --- Observers ---

    /// Registers a callback invoked once per completed cycle with the new epoch.
    pub fn subscribe(&self, observer: impl Fn(Epoch) + Send + Sync + 'static) -> Result<ObserverId> {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .map_err(|_| PivotError::Poisoned("pool observers"))?
            .insert(id, Arc::new(observer));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> Result<bool> {
        Ok(self
            .observers
            .lock()
            .map_err(|_| PivotError::Poisoned("pool observers"))?
            .shift_remove(&id)
            .is_some())
    }

    fn notify_observers(&self, epoch: Epoch) -> Result<()> {
        // callbacks run unlocked so they may (un)subscribe
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .map_err(|_| PivotError::Poisoned("pool observers"))?
            .values()
            .cloned()
            .collect();
        for observer in observers {
            observer(epoch);
        }
        Ok(())
    }

    pub fn update_task(&self) -> UpdateTask<'_> {
        UpdateTask::new(self)
    }
}

/// Holds the pool's running flag for the duration of one cycle.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| RunningGuard(flag))
            .map_err(|_| PivotError::CycleInFlight)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs cycles against a pool.
#[derive(Debug, Clone, Copy)]
pub struct UpdateTask<'a> {
    pool: &'a Pool,
}

impl<'a> UpdateTask<'a> {
    pub fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    /// Full cycle over every stage in registration order.
    pub fn run(&self) -> Result<CycleStats> {
        self.run_cycle(None)
    }

    /// Cycle that processes and clears only `id`. The data signal is re-armed
    /// afterwards if any other stage still holds pending input.
    pub fn run_stage(&self, id: StageId) -> Result<CycleStats> {
        self.run_cycle(Some(id))
    }

    #[instrument(level = "debug", skip(self))]
    fn run_cycle(&self, scope: Option<StageId>) -> Result<CycleStats> {
        let pool = self.pool;
        let _guard = RunningGuard::acquire(&pool.running)?;
        let started = Instant::now();
        if let Some(hook) = &pool.hook {
            hook.on_cycle_start(pool.epoch());
        }

        let mut processed = 0;
        let did_work;
        {
            let mut stages = pool.lock_stages()?;
            if let Some(id) = scope {
                if !stages.contains_key(&id) {
                    return Err(PivotError::UnknownStage(id));
                }
            }
            let in_scope = |id: StageId| scope.map_or(true, |s| s == id);

            did_work = pool.signal.take();
            if did_work {
                let mut failure = None;
                for (&id, stage) in stages.iter_mut().filter(|(id, _)| in_scope(**id)) {
                    match stage.process() {
                        Ok(()) => processed += 1,
                        Err(source) => {
                            failure = Some(PivotError::Stage {
                                id,
                                name: SmolStr::new(stage.name()),
                                source,
                            });
                            break;
                        }
                    }
                }
                if let Some(err) = failure {
                    if stages.values().any(|s| s.has_pending()) {
                        pool.signal.mark();
                    }
                    warn!(error = %err, "cycle aborted");
                    return Err(err);
                }

                for (_, stage) in stages.iter_mut().filter(|(id, _)| in_scope(**id)) {
                    stage.clear_output_ports();
                }
                if scope.is_some() && stages.values().any(|s| s.has_pending()) {
                    pool.signal.mark();
                }
            }
        }

        let epoch = pool.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        pool.notify_observers(epoch)?;

        let stats = CycleStats {
            epoch,
            processed_stages: processed,
            elapsed: started.elapsed(),
            did_work,
        };
        if let Some(hook) = &pool.hook {
            hook.on_cycle_end(&stats);
        }
        debug!(epoch, processed, did_work, "cycle complete");
        Ok(stats)
    }
}
