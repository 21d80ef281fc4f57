use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

type TaskFn = Box<dyn FnMut() + Send>;

struct Task {
    name: String,
    interval: Duration,
    /// Unix millis of the next allowed run.
    next_due_ms: i64,
    run: TaskFn,
}

/// Minimal interval scheduler: a handful of named tasks serviced by one
/// loop thread, strictly serialized. The task list mutex doubles as the
/// serialization point, so `run_task_once` from another thread can never
/// overlap the loop.
pub struct Scheduler {
    tasks: Arc<Mutex<Vec<Task>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Register a task. The first run happens one full interval after
    /// `start`, matching timer semantics of the rest of the system.
    pub fn add_task(&self, name: &str, interval: Duration, run: impl FnMut() + Send + 'static) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(Task {
            name: name.to_string(),
            interval,
            next_due_ms: now_ms() + interval.as_millis() as i64,
            run: Box::new(run),
        });
    }

    pub fn task_names(&self) -> Vec<String> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.iter().map(|t| t.name.clone()).collect()
    }

    /// Trigger one task immediately, serialized with the loop. Returns
    /// false for an unknown name.
    pub fn run_task_once(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = tasks.iter_mut().find(|t| t.name == name) else {
            return false;
        };
        debug!(task = %name, "manual task trigger");
        (task.run)();
        task.next_due_ms = now_ms() + task.interval.as_millis() as i64;
        true
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("scheduler already started");
            return;
        }

        let tasks = Arc::clone(&self.tasks);
        let stop = Arc::clone(&self.stop);
        self.handle = Some(thread::spawn(move || loop_thread(tasks, stop)));
        info!("scheduler started");
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the loop and wait for an in-flight task to finish.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn loop_thread(tasks: Arc<Mutex<Vec<Task>>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        {
            let mut tasks = tasks.lock().unwrap_or_else(|e| e.into_inner());
            // Earliest-due task first; one task per tick keeps the stop
            // flag responsive even with several tasks due at once.
            let now = now_ms();
            if let Some(task) = tasks
                .iter_mut()
                .filter(|t| t.next_due_ms <= now)
                .min_by_key(|t| t.next_due_ms)
            {
                debug!(task = %task.name, "running due task");
                (task.run)();
                task.next_due_ms = now_ms() + task.interval.as_millis() as i64;
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_task_once_executes_and_reschedules() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&counter);
        scheduler.add_task("bump", Duration::from_secs(3600), move || {
            task_counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.run_task_once("bump"));
        assert!(scheduler.run_task_once("bump"));
        assert!(!scheduler.run_task_once("unknown"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn started_loop_runs_due_tasks() {
        let mut scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&counter);
        scheduler.add_task("tick", Duration::from_millis(10), move || {
            task_counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.start();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        scheduler.stop();

        assert!(counter.load(Ordering::SeqCst) >= 1, "task never fired");
    }

    #[test]
    fn tasks_never_overlap() {
        let mut scheduler = Scheduler::new();
        // Not atomic on purpose: overlapping runs would race on the guard.
        let active = Arc::new(Mutex::new(false));
        let overlap_seen = Arc::new(AtomicBool::new(false));

        for name in ["a", "b"] {
            let active = Arc::clone(&active);
            let overlap_seen = Arc::clone(&overlap_seen);
            scheduler.add_task(name, Duration::from_millis(5), move || {
                {
                    let mut flag = active.lock().expect("guard");
                    if *flag {
                        overlap_seen.store(true, Ordering::SeqCst);
                    }
                    *flag = true;
                }
                thread::sleep(Duration::from_millis(15));
                *active.lock().expect("guard") = false;
            });
        }

        scheduler.start();
        thread::sleep(Duration::from_millis(300));
        // Manual triggers contend with the loop through the same mutex.
        scheduler.run_task_once("a");
        scheduler.stop();

        assert!(!overlap_seen.load(Ordering::SeqCst));
    }
}
