//! Task queue: FIFO dispatch, cancellation and update events

use crate::error::{Result, TranscribeError};
use crate::task::{FileTranscriptionTask, ProgressEvent, Segment, TaskId, TaskStatus};
use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Executes one task on behalf of the queue.
///
/// Implementations check `cancel` between units of work and return
/// [`TranscribeError::Cancelled`] once they notice it.
pub trait TaskRunner: Send + Sync + 'static {
    fn run_task(
        &self,
        task: FileTranscriptionTask,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> impl Future<Output = Result<Vec<Segment>>> + Send;
}

/// What the queue publishes to its observers
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A task changed status; carries a snapshot of the task after the change
    TaskUpdated(FileTranscriptionTask),
    Progress {
        task_id: TaskId,
        progress: ProgressEvent,
    },
    /// The run loop has exited
    Completed,
    /// Never broadcast: [`QueueHandle::events`] yields it when its subscriber
    /// fell behind and `skipped` events were lost
    Lagged { skipped: u64 },
}

#[derive(Debug)]
enum QueueCommand {
    Add(Box<FileTranscriptionTask>),
    Cancel(TaskId),
    Unfinished(oneshot::Sender<Vec<TaskId>>),
    Stop,
}

/// Publishes progress for one running task
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    events: broadcast::Sender<QueueEvent>,
}

impl ProgressReporter {
    pub fn report(&self, progress: ProgressEvent) {
        debug!(task_id = %self.task_id, completed = progress.completed, total = progress.total, "progress");
        let _ = self.events.send(QueueEvent::Progress {
            task_id: self.task_id,
            progress,
        });
    }
}

/// How many tasks may be in progress at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    #[default]
    Sequential,
    Bounded(NonZeroUsize),
}

impl Concurrency {
    /// `0` and `1` both mean sequential
    pub fn workers(count: usize) -> Self {
        match NonZeroUsize::new(count) {
            Some(n) if n.get() > 1 => Concurrency::Bounded(n),
            _ => Concurrency::Sequential,
        }
    }

    pub fn limit(&self) -> usize {
        match self {
            Concurrency::Sequential => 1,
            Concurrency::Bounded(n) => n.get(),
        }
    }
}

/// Cloneable control side of a [`TranscriptionTaskQueue`].
///
/// Dropping every handle stops the queue the same way [`QueueHandle::stop`] does.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    commands: mpsc::UnboundedSender<QueueCommand>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueHandle {
    /// Submit a task. It is reset to QUEUED whatever state it was in.
    pub fn add_task(&self, task: FileTranscriptionTask) -> Result<TaskId> {
        let id = task.id;
        self.send(QueueCommand::Add(Box::new(task)))?;
        Ok(id)
    }

    /// Cancel a queued or running task; unknown and finished ids are ignored
    pub fn cancel_task(&self, id: TaskId) -> Result<()> {
        self.send(QueueCommand::Cancel(id))
    }

    /// Ask the run loop to exit once running tasks finish. Does not wait.
    pub fn stop(&self) -> Result<()> {
        self.send(QueueCommand::Stop)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Events from now on. A subscriber that falls behind gets one
    /// [`QueueEvent::Lagged`] in place of what it missed.
    pub fn events(&self) -> impl Stream<Item = QueueEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).map(|event| match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "queue event subscriber lagged");
                QueueEvent::Lagged { skipped }
            }
        })
    }

    /// Ids of the running tasks, then of the queued ones in FIFO order.
    ///
    /// Every status update sent before the answer is already in the event
    /// channel, so a subscriber can use this to resynchronize after a lag.
    pub async fn unfinished(&self) -> Result<Vec<TaskId>> {
        let (reply, answer) = oneshot::channel();
        self.send(QueueCommand::Unfinished(reply))?;
        answer.await.map_err(|_| TranscribeError::QueueClosed)
    }

    fn send(&self, command: QueueCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TranscribeError::QueueClosed)
    }
}

struct ActiveTask {
    task: FileTranscriptionTask,
    cancel: CancellationToken,
}

type Outcome = std::thread::Result<Result<Vec<Segment>>>;

/// Worker owning every submitted task until it reaches a terminal status.
///
/// Only the worker mutates task state; observers see snapshots through
/// [`QueueEvent::TaskUpdated`], exactly one per status transition.
pub struct TranscriptionTaskQueue<R> {
    runner: Arc<R>,
    concurrency: Concurrency,
    commands: mpsc::UnboundedReceiver<QueueCommand>,
    events: broadcast::Sender<QueueEvent>,
    pending: VecDeque<FileTranscriptionTask>,
    active: HashMap<TaskId, ActiveTask>,
}

impl<R: TaskRunner> TranscriptionTaskQueue<R> {
    pub fn new(runner: R, concurrency: Concurrency) -> (Self, QueueHandle) {
        Self::with_shared_runner(Arc::new(runner), concurrency)
    }

    pub fn with_shared_runner(runner: Arc<R>, concurrency: Concurrency) -> (Self, QueueHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let queue = Self {
            runner,
            concurrency,
            commands: command_rx,
            events: event_tx.clone(),
            pending: VecDeque::new(),
            active: HashMap::new(),
        };
        let handle = QueueHandle {
            commands: command_tx,
            events: event_tx,
        };
        (queue, handle)
    }

    /// Process commands and tasks until stopped.
    ///
    /// After a stop no further task is started: running tasks finish,
    /// pending ones are left QUEUED, and [`QueueEvent::Completed`] is sent last.
    pub async fn run(mut self) {
        info!(concurrency = self.concurrency.limit(), "task queue started");

        let mut running: JoinSet<(TaskId, Outcome)> = JoinSet::new();
        let mut stopping = false;
        let mut commands_open = true;

        loop {
            if !stopping {
                self.dispatch(&mut running);
            }
            if stopping && running.is_empty() {
                break;
            }

            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(QueueCommand::Add(task)) => self.enqueue(*task, stopping),
                    Some(QueueCommand::Cancel(id)) => self.cancel(id),
                    Some(QueueCommand::Unfinished(reply)) => {
                        let _ = reply.send(self.unfinished());
                    }
                    Some(QueueCommand::Stop) => {
                        debug!("stop requested");
                        stopping = true;
                    }
                    None => {
                        debug!("all queue handles dropped");
                        commands_open = false;
                        stopping = true;
                    }
                },
                Some(joined) = running.join_next(), if !running.is_empty() => match joined {
                    Ok((id, outcome)) => self.finish(id, outcome),
                    Err(e) => error!("task join failed: {}", e),
                },
            }
        }

        if !self.pending.is_empty() {
            info!(abandoned = self.pending.len(), "queue stopped with pending tasks");
        }
        info!("task queue finished");
        self.emit(QueueEvent::Completed);
    }

    fn enqueue(&mut self, mut task: FileTranscriptionTask, stopping: bool) {
        if self.active.contains_key(&task.id) || self.pending.iter().any(|t| t.id == task.id) {
            warn!(task_id = %task.id, "task already queued, ignoring resubmission");
            return;
        }

        task.reset();
        debug!(task_id = %task.id, input = %task.input, "task queued");
        self.emit(QueueEvent::TaskUpdated(task.clone()));
        if stopping {
            debug!(task_id = %task.id, "queue is stopping, task will not run");
        }
        self.pending.push_back(task);
    }

    fn cancel(&mut self, id: TaskId) {
        if let Some(position) = self.pending.iter().position(|t| t.id == id) {
            if let Some(mut task) = self.pending.remove(position) {
                info!(task_id = %id, "cancelled queued task");
                task.status = TaskStatus::Canceled;
                task.completed_at = Some(Utc::now());
                self.emit(QueueEvent::TaskUpdated(task));
            }
        } else if let Some(active) = self.active.get(&id) {
            info!(task_id = %id, "cancelling running task");
            active.cancel.cancel();
        } else {
            debug!(task_id = %id, "cancel for unknown or finished task ignored");
        }
    }

    fn unfinished(&self) -> Vec<TaskId> {
        let mut active: Vec<_> = self.active.values().map(|a| &a.task).collect();
        active.sort_by_key(|t| t.started_at);
        active
            .into_iter()
            .chain(self.pending.iter())
            .map(|t| t.id)
            .collect()
    }

    fn dispatch(&mut self, running: &mut JoinSet<(TaskId, Outcome)>) {
        while self.active.len() < self.concurrency.limit() {
            let Some(mut task) = self.pending.pop_front() else {
                break;
            };

            task.status = TaskStatus::InProgress;
            task.started_at = Some(Utc::now());
            info!(task_id = %task.id, input = %task.input, "task started");
            self.emit(QueueEvent::TaskUpdated(task.clone()));

            let id = task.id;
            let cancel = CancellationToken::new();
            let runner = Arc::clone(&self.runner);
            let reporter = ProgressReporter {
                task_id: id,
                events: self.events.clone(),
            };
            let job = task.clone();
            let token = cancel.clone();
            running.spawn(async move {
                let outcome = AssertUnwindSafe(runner.run_task(job, token, reporter))
                    .catch_unwind()
                    .await;
                (id, outcome)
            });

            self.active.insert(id, ActiveTask { task, cancel });
        }
    }

    fn finish(&mut self, id: TaskId, outcome: Outcome) {
        let Some(ActiveTask { mut task, cancel }) = self.active.remove(&id) else {
            warn!(task_id = %id, "finished task was not active");
            return;
        };

        match outcome {
            _ if cancel.is_cancelled() => {
                info!(task_id = %id, "task cancelled");
                task.status = TaskStatus::Canceled;
            }
            Ok(Ok(segments)) => {
                info!(task_id = %id, segments = segments.len(), "task completed");
                task.status = TaskStatus::Completed;
                task.segments = segments;
            }
            Ok(Err(err)) if err.is_cancellation() => {
                info!(task_id = %id, "task cancelled");
                task.status = TaskStatus::Canceled;
            }
            Ok(Err(err)) => {
                error!(task_id = %id, "task failed: {}", err);
                task.status = TaskStatus::Failed;
                task.error = Some(err.to_string());
            }
            Err(_) => {
                error!(task_id = %id, "task runner panicked");
                task.status = TaskStatus::Failed;
                task.error = Some("Transcription panicked".to_string());
            }
        }

        task.completed_at = Some(Utc::now());
        self.emit(QueueEvent::TaskUpdated(task));
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TranscriptionOptions;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Fails inputs named `fail*`, otherwise returns one segment per task
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<TaskId>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedRunner {
        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<TaskId> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TaskRunner for ScriptedRunner {
        async fn run_task(
            &self,
            task: FileTranscriptionTask,
            _cancel: CancellationToken,
            progress: ProgressReporter,
        ) -> Result<Vec<Segment>> {
            self.calls.lock().unwrap().push(task.id);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if task.input.display_name().starts_with("fail") {
                return Err(TranscribeError::backend(Some(500), "boom"));
            }
            progress.report(ProgressEvent::new(1, 1));
            Ok(vec![Segment::new(0, 1_000, task.input.display_name())])
        }
    }

    fn task(name: &str) -> FileTranscriptionTask {
        FileTranscriptionTask::from_file(format!("/media/{}.wav", name), TranscriptionOptions::new())
    }

    async fn next_event(events: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a queue event")
            .unwrap()
    }

    /// Skip events until `id` reaches `status`, returning that snapshot
    async fn wait_for(
        events: &mut broadcast::Receiver<QueueEvent>,
        id: TaskId,
        status: TaskStatus,
    ) -> FileTranscriptionTask {
        loop {
            if let QueueEvent::TaskUpdated(task) = next_event(events).await {
                if task.id == id && task.status == status {
                    return task;
                }
            }
        }
    }

    async fn wait_for_completed(events: &mut broadcast::Receiver<QueueEvent>) {
        while !matches!(next_event(events).await, QueueEvent::Completed) {}
    }

    #[test]
    fn worker_counts() {
        assert_eq!(Concurrency::workers(0), Concurrency::Sequential);
        assert_eq!(Concurrency::workers(1), Concurrency::Sequential);
        assert_eq!(Concurrency::workers(3).limit(), 3);
    }

    #[tokio::test]
    async fn tasks_move_through_each_status_once() {
        let (queue, handle) = TranscriptionTaskQueue::new(ScriptedRunner::default(), Concurrency::Sequential);
        let mut events = handle.subscribe();
        let worker = tokio::spawn(queue.run());

        let talk = task("talk");
        let id = handle.add_task(talk).unwrap();

        let mut statuses = Vec::new();
        let mut progress = Vec::new();
        loop {
            match next_event(&mut events).await {
                QueueEvent::TaskUpdated(t) => {
                    assert_eq!(t.id, id);
                    statuses.push(t.status);
                    if t.status.is_terminal() {
                        assert_eq!(t.segments, vec![Segment::new(0, 1_000, "talk")]);
                        assert!(t.started_at.is_some() && t.completed_at.is_some());
                        break;
                    }
                }
                QueueEvent::Progress { task_id, progress: p } => {
                    assert_eq!(task_id, id);
                    progress.push(p);
                }
                QueueEvent::Completed | QueueEvent::Lagged { .. } => {
                    panic!("unexpected event")
                }
            }
        }

        assert_eq!(
            statuses,
            vec![TaskStatus::Queued, TaskStatus::InProgress, TaskStatus::Completed]
        );
        assert_eq!(progress, vec![ProgressEvent::new(1, 1)]);

        handle.stop().unwrap();
        wait_for_completed(&mut events).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn failure_does_not_stop_later_tasks() {
        let (queue, handle) = TranscriptionTaskQueue::new(ScriptedRunner::default(), Concurrency::Sequential);
        let mut events = handle.subscribe();
        tokio::spawn(queue.run());

        let bad = handle.add_task(task("fail-1")).unwrap();
        let good = handle.add_task(task("good")).unwrap();

        let failed = wait_for(&mut events, bad, TaskStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("Backend error (HTTP 500): boom"));
        assert!(failed.segments.is_empty());

        let done = wait_for(&mut events, good, TaskStatus::Completed).await;
        assert_eq!(done.text(), "good");
    }

    #[tokio::test]
    async fn cancelling_a_queued_task_never_runs_it() {
        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::gated(gate.clone()));
        let (queue, handle) =
            TranscriptionTaskQueue::with_shared_runner(runner.clone(), Concurrency::Sequential);
        let mut events = handle.subscribe();
        tokio::spawn(queue.run());

        let first = handle.add_task(task("first")).unwrap();
        let second = handle.add_task(task("second")).unwrap();
        wait_for(&mut events, first, TaskStatus::InProgress).await;

        handle.cancel_task(second).unwrap();
        let cancelled = wait_for(&mut events, second, TaskStatus::Canceled).await;
        assert!(cancelled.started_at.is_none());

        gate.add_permits(1);
        wait_for(&mut events, first, TaskStatus::Completed).await;
        assert_eq!(runner.calls(), vec![first]);
    }

    #[tokio::test]
    async fn cancelled_running_task_discards_its_result() {
        let gate = Arc::new(Semaphore::new(0));
        let (queue, handle) =
            TranscriptionTaskQueue::new(ScriptedRunner::gated(gate.clone()), Concurrency::Sequential);
        let mut events = handle.subscribe();
        tokio::spawn(queue.run());

        let id = handle.add_task(task("long")).unwrap();
        wait_for(&mut events, id, TaskStatus::InProgress).await;

        handle.cancel_task(id).unwrap();
        handle.cancel_task(TaskId::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(1);

        let cancelled = wait_for(&mut events, id, TaskStatus::Canceled).await;
        assert!(cancelled.segments.is_empty());
        assert!(cancelled.error.is_none());
    }

    #[tokio::test]
    async fn stop_lets_running_task_finish_and_abandons_the_rest() {
        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::gated(gate.clone()));
        let (queue, handle) =
            TranscriptionTaskQueue::with_shared_runner(runner.clone(), Concurrency::Sequential);
        let mut events = handle.subscribe();
        let worker = tokio::spawn(queue.run());

        let running = handle.add_task(task("running")).unwrap();
        handle.add_task(task("waiting")).unwrap();
        wait_for(&mut events, running, TaskStatus::InProgress).await;

        handle.stop().unwrap();
        gate.add_permits(1);

        let mut seen = Vec::new();
        loop {
            match next_event(&mut events).await {
                QueueEvent::TaskUpdated(t) => seen.push((t.input.display_name(), t.status)),
                QueueEvent::Progress { .. } | QueueEvent::Lagged { .. } => {}
                QueueEvent::Completed => break,
            }
        }
        assert_eq!(seen.last(), Some(&("running".to_string(), TaskStatus::Completed)));
        assert!(!seen.contains(&("waiting".to_string(), TaskStatus::InProgress)));

        worker.await.unwrap();
        assert_eq!(runner.calls(), vec![running]);
        assert_eq!(handle.add_task(task("late")), Err(TranscribeError::QueueClosed));
    }

    #[tokio::test]
    async fn dropping_every_handle_ends_the_run() {
        let (queue, handle) = TranscriptionTaskQueue::new(ScriptedRunner::default(), Concurrency::Sequential);
        let mut events = handle.subscribe();
        let worker = tokio::spawn(queue.run());

        drop(handle);
        wait_for_completed(&mut events).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn bounded_concurrency_runs_tasks_side_by_side() {
        let gate = Arc::new(Semaphore::new(0));
        let (queue, handle) = TranscriptionTaskQueue::new(
            ScriptedRunner::gated(gate.clone()),
            Concurrency::workers(2),
        );
        let mut events = handle.subscribe();
        tokio::spawn(queue.run());

        let a = handle.add_task(task("a")).unwrap();
        let b = handle.add_task(task("b")).unwrap();
        wait_for(&mut events, a, TaskStatus::InProgress).await;
        wait_for(&mut events, b, TaskStatus::InProgress).await;

        gate.add_permits(2);
        let mut finished = 0;
        while finished < 2 {
            if let QueueEvent::TaskUpdated(t) = next_event(&mut events).await {
                if t.status == TaskStatus::Completed {
                    finished += 1;
                }
            }
        }
    }

    #[tokio::test]
    async fn resubmitted_task_is_reset_to_queued() {
        let (queue, handle) = TranscriptionTaskQueue::new(ScriptedRunner::default(), Concurrency::Sequential);
        let mut events = handle.subscribe();
        tokio::spawn(queue.run());

        let mut old = task("again");
        old.status = TaskStatus::Failed;
        old.error = Some("earlier failure".into());
        let id = handle.add_task(old).unwrap();

        let queued = wait_for(&mut events, id, TaskStatus::Queued).await;
        assert!(queued.error.is_none());
        assert!(queued.queued_at.is_some());
        wait_for(&mut events, id, TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn unfinished_lists_running_then_queued() {
        let gate = Arc::new(Semaphore::new(0));
        let (queue, handle) =
            TranscriptionTaskQueue::new(ScriptedRunner::gated(gate.clone()), Concurrency::Sequential);
        let mut events = handle.subscribe();
        let worker = tokio::spawn(queue.run());

        let a = handle.add_task(task("a")).unwrap();
        let b = handle.add_task(task("b")).unwrap();
        let c = handle.add_task(task("c")).unwrap();
        assert_eq!(handle.unfinished().await.unwrap(), vec![a, b, c]);

        gate.add_permits(1);
        wait_for(&mut events, a, TaskStatus::Completed).await;
        assert_eq!(handle.unfinished().await.unwrap(), vec![b, c]);

        handle.stop().unwrap();
        gate.add_permits(1);
        worker.await.unwrap();
        assert_eq!(handle.unfinished().await, Err(TranscribeError::QueueClosed));
    }

    #[tokio::test]
    async fn slow_subscriber_is_told_it_lagged() {
        let gate = Arc::new(Semaphore::new(0));
        let (queue, handle) =
            TranscriptionTaskQueue::new(ScriptedRunner::gated(gate), Concurrency::Sequential);
        let events = handle.events();
        tokio::spawn(queue.run());

        for i in 0..EVENT_CAPACITY + 10 {
            handle.add_task(task(&format!("t{}", i))).unwrap();
        }
        handle.unfinished().await.unwrap();

        let mut events = std::pin::pin!(events);
        match events.next().await {
            Some(QueueEvent::Lagged { skipped }) => assert!(skipped > 0),
            other => panic!("expected a lag notice, got {:?}", other),
        }
    }
}
