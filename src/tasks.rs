use consensus::PaxosId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Controller re-sending `OldActiveSetStop`.
    StopActives,
    /// Controller re-sending `NewActiveSetStart`.
    StartActives,
    /// New active polling old actives for their final values.
    CopyState,
}

/// Identity of a periodic task: what it does and which migration it serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub paxos_id: PaxosId,
}

impl TaskKey {
    pub fn new(kind: TaskKind, paxos_id: PaxosId) -> Self {
        Self { kind, paxos_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Done,
}

struct Stopper {
    generation: u64,
    stop_signal: Arc<AtomicBool>,
}

impl Drop for Stopper {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::Release);
    }
}

struct StopCheck {
    stop_signal: Arc<AtomicBool>,
}

impl StopCheck {
    fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::Acquire)
    }
}

fn stop_signal(generation: u64) -> (Stopper, StopCheck) {
    let stop_signal = Arc::new(AtomicBool::new(false));
    let stopper = Stopper {
        generation,
        stop_signal: stop_signal.clone(),
    };
    (stopper, StopCheck { stop_signal })
}

/// Cancellable periodic background tasks keyed by migration.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<TaskKey, Stopper>>>,
    generations: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskKey, Stopper>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `tick` now and then every `period` until it returns
    /// [`TaskControl::Done`] or the task is cancelled. Returns `false`
    /// without scheduling anything if a task with this key is already running.
    pub fn spawn_periodic<F, Fut>(&self, key: TaskKey, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskControl> + Send + 'static,
    {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (stopper, stop_check) = stop_signal(generation);
        {
            let mut tasks = self.tasks();
            if tasks.contains_key(&key) {
                tracing::trace!("Task {:?} already scheduled", key);
                return false;
            }
            tasks.insert(key.clone(), stopper);
        }

        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if stop_check.should_stop() {
                    break;
                }
                if tick().await == TaskControl::Done {
                    registry.finish(&key, generation);
                    break;
                }
            }
            tracing::trace!("Task {:?} exited", key);
        });
        true
    }

    /// Stops the task if it is still scheduled. Cancelling twice, or after the
    /// task finished on its own, is a no-op.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let removed = self.tasks().remove(key);
        if removed.is_some() {
            tracing::debug!("Cancelled task {:?}", key);
        }
        removed.is_some()
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.tasks().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    pub fn cancel_all(&self) {
        let drained: Vec<(TaskKey, Stopper)> = self.tasks().drain().collect();
        if !drained.is_empty() {
            tracing::debug!("Cancelled {} background tasks", drained.len());
        }
    }

    fn finish(&self, key: &TaskKey, generation: u64) {
        let mut tasks = self.tasks();
        if tasks.get(key).map(|stopper| stopper.generation) == Some(generation) {
            tasks.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(kind: TaskKind) -> TaskKey {
        TaskKey::new(kind, PaxosId::active("alice", 2))
    }

    #[tokio::test]
    async fn runs_until_done() {
        let registry = TaskRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        assert!(registry.spawn_periodic(key(TaskKind::CopyState), Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    TaskControl::Done
                } else {
                    TaskControl::Continue
                }
            }
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(!registry.is_scheduled(&key(TaskKind::CopyState)));
        assert!(!registry.cancel(&key(TaskKind::CopyState)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_ticks() {
        let registry = TaskRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let stop_key = key(TaskKind::StopActives);

        registry.spawn_periodic(stop_key.clone(), Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskControl::Continue
            }
        });
        assert!(!registry.spawn_periodic(stop_key.clone(), Duration::from_millis(5), || async {
            TaskControl::Done
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.cancel(&stop_key));
        assert!(!registry.cancel(&stop_key));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
        assert!(registry.is_empty());
    }
}
