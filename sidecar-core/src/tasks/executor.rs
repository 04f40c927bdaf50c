use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::periodic::{PeriodicTask, ScheduleDecision, TaskRescheduler};
use crate::error::{Result, SidecarError};

enum Command {
    Schedule(Arc<dyn PeriodicTask>),
    Unschedule(String),
    Reschedule(String),
}

struct ScheduledTask {
    task: Arc<dyn PeriodicTask>,
    /// `None` while a run is in progress.
    next_run: Option<Instant>,
    generation: u64,
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Drives [`PeriodicTask`]s from a single dispatch loop.
///
/// The loop only evaluates schedule decisions and delays; task bodies run
/// on their own tokio tasks so a slow run never holds up the others.
/// Clones share the same loop.
#[derive(Clone)]
pub struct PeriodicTaskExecutor {
    shared: Arc<Shared>,
}

impl fmt::Debug for PeriodicTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTaskExecutor")
            .field("shutdown_cancelled", &self.shared.shutdown.is_cancelled())
            .field("dispatcher_running", &self.shared.dispatcher.lock().is_some())
            .finish()
    }
}

impl PeriodicTaskExecutor {
    /// Start the dispatch loop on the current tokio runtime.
    pub fn new() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_loop(rx, shutdown.clone()));
        Self {
            shared: Arc::new(Shared {
                commands,
                shutdown,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        }
    }

    /// Register a task. Its first run happens after `initial_delay()`.
    pub fn schedule(&self, task: Arc<dyn PeriodicTask>) -> Result<()> {
        task.register_periodic_task_executor(Arc::new(self.clone()));
        self.send(Command::Schedule(task))
    }

    /// Stop scheduling the named task. A run in progress is not interrupted.
    pub fn unschedule(&self, task_name: &str) -> Result<()> {
        self.send(Command::Unschedule(task_name.to_owned()))
    }

    /// Stop dispatching and wait for runs in progress to finish.
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        let dispatcher = self.shared.dispatcher.lock().take();
        if let Some(handle) = dispatcher
            && let Err(err) = handle.await
        {
            error!("Periodic task dispatcher terminated abnormally: {err}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(SidecarError::Cancelled(
                "periodic task executor is closed".into(),
            ));
        }
        self.shared.commands.send(command).map_err(|_| {
            SidecarError::Cancelled("periodic task dispatcher has stopped".into())
        })
    }
}

impl TaskRescheduler for PeriodicTaskExecutor {
    fn reschedule(&self, task_name: &str) {
        if let Err(err) = self.send(Command::Reschedule(task_name.to_owned())) {
            debug!(task = task_name, "Ignoring reschedule request: {err}");
        }
    }
}

async fn dispatch_loop(
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut tasks: HashMap<String, ScheduledTask> = HashMap::new();
    // each run yields the name and generation it was started for
    let mut running: JoinSet<(String, u64)> = JoinSet::new();
    let mut next_generation: u64 = 0;

    loop {
        let next_deadline = tasks.values().filter_map(|entry| entry.next_run).min();
        let wake = async move {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Periodic task dispatcher shutting down");
                break;
            }
            command = commands.recv() => match command {
                Some(Command::Schedule(task)) => {
                    let name = task.name().to_owned();
                    if tasks.contains_key(&name) {
                        warn!(task = %name, "Task already scheduled; ignoring");
                        continue;
                    }
                    let next_run = Instant::now() + task.initial_delay();
                    next_generation += 1;
                    debug!(task = %name, "Scheduled periodic task");
                    tasks.insert(name, ScheduledTask {
                        task,
                        next_run: Some(next_run),
                        generation: next_generation,
                    });
                }
                Some(Command::Unschedule(name)) => {
                    if tasks.remove(&name).is_some() {
                        debug!(task = %name, "Unscheduled periodic task");
                    }
                }
                Some(Command::Reschedule(name)) => {
                    if let Some(entry) = tasks.get_mut(&name)
                        && entry.next_run.is_some()
                    {
                        let delay = entry.task.delay();
                        trace!(task = %name, ?delay, "Rescheduling periodic task");
                        entry.next_run = Some(Instant::now() + delay);
                    }
                }
                None => break,
            },
            Some(finished) = running.join_next(), if !running.is_empty() => {
                match finished {
                    Ok((name, generation)) => {
                        if let Some(entry) = tasks.get_mut(&name)
                            && entry.generation == generation
                        {
                            entry.next_run = Some(Instant::now() + entry.task.delay());
                        }
                    }
                    Err(err) => error!("Periodic task run aborted: {err}"),
                }
            }
            _ = wake => {
                let now = Instant::now();
                for (name, entry) in tasks.iter_mut() {
                    if !entry.next_run.is_some_and(|at| at <= now) {
                        continue;
                    }
                    match entry.task.schedule_decision() {
                        ScheduleDecision::Skip => {
                            trace!(task = %name, "Skipping periodic task run");
                            entry.next_run = Some(now + entry.task.delay());
                        }
                        ScheduleDecision::Execute => {
                            entry.next_run = None;
                            let task = Arc::clone(&entry.task);
                            let task_name = name.clone();
                            let generation = entry.generation;
                            running.spawn(async move {
                                // a panicking body must still hand its slot back
                                match tokio::spawn(async move { task.execute().await }).await {
                                    Ok(Ok(())) => {}
                                    Ok(Err(err)) => {
                                        warn!(task = %task_name, "Periodic task run failed: {err}");
                                    }
                                    Err(err) => {
                                        error!(task = %task_name, "Periodic task run panicked: {err}");
                                    }
                                }
                                (task_name, generation)
                            });
                        }
                    }
                }
            }
        }
    }

    while let Some(finished) = running.join_next().await {
        if let Err(err) = finished {
            error!("Periodic task run aborted during shutdown: {err}");
        }
    }
}
