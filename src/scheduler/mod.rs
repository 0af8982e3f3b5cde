use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    /// Whether this run was started by a [`Trigger`] rather than the timer.
    pub triggered: bool,
}

/// Trait for background tasks that run periodically
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    fn execute(&self, ctx: Context) -> Result<()>;
}

/// Wakes a registered task ahead of its interval. Cheap to clone; repeated
/// fires before the task runs collapse into one run.
#[derive(Clone, Default)]
pub struct Trigger {
    inner: Arc<TriggerState>,
}

#[derive(Default)]
struct TriggerState {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        *self.inner.fired.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.inner.cond.notify_one();
    }

    /// Waits until fired or `timeout` elapses. Returns whether it was fired.
    fn wait(&self, timeout: Duration) -> bool {
        let fired = self.inner.fired.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut fired, _) = self
            .inner
            .cond
            .wait_timeout_while(fired, timeout, |fired| !*fired)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *fired, false)
    }
}

/// Scheduler runs each background task on its own thread with graceful
/// shutdown
pub struct Scheduler {
    tasks: Mutex<Vec<(Trigger, JoinHandle<()>)>>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a periodic background task. The returned trigger runs it
    /// early.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<Trigger> {
        let trigger = Trigger::new();
        let handle = self.spawn_timer_loop(task, trigger.clone())?;
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((trigger.clone(), handle));
        Ok(trigger)
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(
        &self,
        task: Arc<T>,
        trigger: Trigger,
    ) -> Result<JoinHandle<()>> {
        let interval = task.interval();
        let shutdown = self.shutdown.clone();
        let mut run_id = 0u64;

        let handle = thread::Builder::new()
            .name(format!("task-{}", task.name()))
            .spawn(move || loop {
                let triggered = trigger.wait(interval);
                if shutdown.load(Ordering::SeqCst) {
                    tracing::info!(task = task.name(), "Task shutting down");
                    break;
                }

                run_id += 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    triggered,
                };

                if let Err(e) = task.execute(ctx) {
                    tracing::error!(
                        task = task.name(),
                        error = %e,
                        "Task execution failed"
                    );
                }
            })?;

        Ok(handle)
    }

    /// Graceful shutdown - wait for all tasks
    pub fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown.store(true, Ordering::SeqCst);

        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (trigger, _) in &tasks {
            trigger.fire();
        }

        // Wait for all tasks to complete
        for (_, handle) in tasks {
            handle
                .join()
                .map_err(|_| crate::Error::InvalidState("Task thread panicked".to_string()))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct TestTask {
        name: &'static str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
        triggered: Arc<AtomicUsize>,
    }

    impl TestTask {
        fn new(interval: Duration) -> Arc<Self> {
            Arc::new(TestTask {
                name: "test-task",
                interval,
                counter: Arc::new(AtomicUsize::new(0)),
                triggered: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn execute(&self, ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            if ctx.triggered {
                self.triggered.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn test_scheduler_basic() -> Result<()> {
        let scheduler = Scheduler::new();
        let task = TestTask::new(Duration::from_millis(10));
        let counter = task.counter.clone();

        scheduler.register(task)?;

        // Let it run for a bit
        thread::sleep(Duration::from_millis(60));

        // Should have executed multiple times
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_trigger_runs_task_early() -> Result<()> {
        let scheduler = Scheduler::new();
        let task = TestTask::new(Duration::from_secs(3600));
        let counter = task.counter.clone();
        let triggered = task.triggered.clone();

        let trigger = scheduler.register(task)?;
        trigger.fire();

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(triggered.load(Ordering::SeqCst), 1);

        scheduler.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_scheduler_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let task = TestTask::new(Duration::from_secs(3600));
        let counter = task.counter.clone();

        scheduler.register(task)?;

        // Shutdown must not wait out the interval
        let start = Instant::now();
        scheduler.shutdown()?;
        assert!(start.elapsed() < Duration::from_secs(1));

        // The wake-up used for shutdown does not count as a run
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        Ok(())
    }
}
