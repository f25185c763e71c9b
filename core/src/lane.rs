//! Speech lane: the ordered playback queue.
//!
//! At most one job plays at a time. High-priority jobs jump ahead of normal and
//! low ones but stay FIFO among themselves. Jobs that aged past `max_age`, or
//! that belong to a superseded session, are discarded at dequeue time without
//! running their executor.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{names, EventBus};
use crate::util::{lock, preview};
use crate::{Result, TtsError};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type JobExecutor = Box<dyn FnOnce(CancellationToken) -> BoxFuture<Result<()>> + Send>;
type StateCallback = Arc<dyn Fn(LaneActivity) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneActivity {
    Playing,
    Idle,
}

/// Terminal state of one queued job, as seen through its [`JobTicket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Played,
    Failed(String),
    Aborted,
    Stale,
    SessionMismatch,
    /// Removed from the queue by `stop(true)` before it started
    Dropped,
    /// Never accepted into the queue
    Rejected,
}

#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub max_queue_size: usize,
    pub default_max_age: Duration,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            default_max_age: Duration::from_millis(8_000),
        }
    }
}

/// A unit of speech work handed to the lane.
pub struct SpeechJob {
    pub text: String,
    pub priority: Priority,
    pub max_age: Option<Duration>,
    /// Explicit session tag; defaults to the lane's session at enqueue time
    pub session_id: Option<String>,
    pub skip_if_busy: bool,
    executor: JobExecutor,
}

impl SpeechJob {
    pub fn new<F, Fut>(text: impl Into<String>, executor: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            text: text.into(),
            priority: Priority::Normal,
            max_age: None,
            session_id: None,
            skip_if_busy: false,
            executor: Box::new(move |cancel| Box::pin(executor(cancel))),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn skip_if_busy(mut self, skip: bool) -> Self {
        self.skip_if_busy = skip;
        self
    }
}

impl std::fmt::Debug for SpeechJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechJob")
            .field("text", &self.text)
            .field("priority", &self.priority)
            .field("max_age", &self.max_age)
            .field("session_id", &self.session_id)
            .field("skip_if_busy", &self.skip_if_busy)
            .finish()
    }
}

/// Receipt for an accepted job.
#[derive(Debug)]
pub struct JobTicket {
    id: String,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the job to reach a terminal state. Never fails.
    pub async fn outcome(self) -> JobOutcome {
        self.outcome.await.unwrap_or(JobOutcome::Dropped)
    }
}

struct QueuedJob {
    id: String,
    text: String,
    priority: Priority,
    enqueued_at: Instant,
    max_age: Duration,
    session_id: Option<String>,
    executor: JobExecutor,
    done: oneshot::Sender<JobOutcome>,
}

struct CurrentJob {
    id: String,
    text: String,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaneStats {
    pub total_enqueued: u64,
    pub total_played: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub total_stale: u64,
    pub total_session_mismatch: u64,
    pub total_aborted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentJobInfo {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneStatus {
    pub is_playing: bool,
    pub queue_length: usize,
    pub session_id: Option<String>,
    pub current_job: Option<CurrentJobInfo>,
    pub stats: LaneStats,
}

struct LaneState {
    queue: VecDeque<QueuedJob>,
    is_playing: bool,
    current: Option<CurrentJob>,
    session_id: Option<String>,
    stats: LaneStats,
}

struct LaneInner {
    config: LaneConfig,
    bus: EventBus,
    state: Mutex<LaneState>,
    next_id: AtomicU64,
    playing: watch::Sender<bool>,
    on_state_change: Mutex<Option<StateCallback>>,
    /// Held across every idle/playing flip and the callback announcing it
    transition: Mutex<()>,
}

thread_local! {
    /// Lane whose transition lock this thread holds (0 for none), so a state
    /// callback that enqueues on the same lane does not deadlock.
    static HELD_TRANSITION: Cell<usize> = const { Cell::new(0) };
}

struct TransitionGuard<'a> {
    held: Option<MutexGuard<'a, ()>>,
    previous: usize,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.held.take().is_some() {
            HELD_TRANSITION.with(|held| held.set(self.previous));
        }
    }
}

/// Cheaply cloneable handle to one speech lane.
#[derive(Clone)]
pub struct SpeechLane {
    inner: Arc<LaneInner>,
}

impl SpeechLane {
    pub fn new(bus: EventBus, config: LaneConfig) -> Self {
        let (playing, _) = watch::channel(false);
        Self {
            inner: Arc::new(LaneInner {
                config,
                bus,
                state: Mutex::new(LaneState {
                    queue: VecDeque::new(),
                    is_playing: false,
                    current: None,
                    session_id: None,
                    stats: LaneStats::default(),
                }),
                next_id: AtomicU64::new(1),
                playing,
                on_state_change: Mutex::new(None),
                transition: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &LaneConfig {
        &self.inner.config
    }

    /// Called with `Playing` when a drain starts and `Idle` when it finishes.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(LaneActivity) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_state_change) = Some(Arc::new(callback));
    }

    /// Queue a job. Returns `None` when a `skip_if_busy` job meets a full queue.
    ///
    /// Must be called from within a tokio runtime; playback runs on a spawned task.
    pub fn enqueue(&self, job: SpeechJob) -> Option<JobTicket> {
        let (tx, rx) = oneshot::channel();
        let id = format!("job-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        // Idle -> Playing must not interleave with a finishing drain's Idle
        let _transition = self.transition();
        let (queue_length, start_drain) = {
            let mut st = lock(&self.inner.state);
            if job.skip_if_busy && st.queue.len() >= self.inner.config.max_queue_size {
                st.stats.total_skipped += 1;
                info!(target: "tts.lane", queue_length = st.queue.len(), "Queue full, skipping non-essential speech");
                return None;
            }

            let queued = QueuedJob {
                id: id.clone(),
                text: job.text,
                priority: job.priority,
                enqueued_at: Instant::now(),
                max_age: job.max_age.unwrap_or(self.inner.config.default_max_age),
                session_id: job.session_id.or_else(|| st.session_id.clone()),
                executor: job.executor,
                done: tx,
            };

            if queued.priority == Priority::High {
                // Behind existing highs, ahead of everything else
                let at = st
                    .queue
                    .iter()
                    .position(|j| j.priority != Priority::High)
                    .unwrap_or(st.queue.len());
                st.queue.insert(at, queued);
            } else {
                st.queue.push_back(queued);
            }
            st.stats.total_enqueued += 1;

            let start = !st.is_playing;
            if start {
                st.is_playing = true;
            }
            (st.queue.len(), start)
        };

        self.inner.bus.emit(
            names::TTS_QUEUE_ADD,
            json!({ "queueLength": queue_length, "jobId": id }),
        );

        if start_drain {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    self.inner.playing.send_replace(true);
                    self.notify_state(LaneActivity::Playing);
                    let lane = self.clone();
                    handle.spawn(async move { lane.drain().await });
                }
                Err(_) => {
                    lock(&self.inner.state).is_playing = false;
                    error!(target: "tts.lane", job = %id, "No async runtime available; job stays queued");
                }
            }
        }

        Some(JobTicket { id, outcome: rx })
    }

    async fn drain(self) {
        loop {
            let next = {
                let _transition = self.transition();
                let mut st = lock(&self.inner.state);
                match st.queue.pop_front() {
                    Some(job) => Some((job, st.session_id.clone())),
                    None => {
                        st.is_playing = false;
                        st.current = None;
                        drop(st);
                        // Announced before waiters wake and before any enqueue
                        // can claim the lane again
                        self.notify_state(LaneActivity::Idle);
                        // The callback itself may have queued more speech
                        if !lock(&self.inner.state).is_playing {
                            self.inner.playing.send_replace(false);
                        }
                        None
                    }
                }
            };
            let Some((job, lane_session)) = next else {
                return;
            };

            if job.enqueued_at.elapsed() > job.max_age {
                debug!(target: "tts.lane", job = %job.id, "Discarding stale job");
                lock(&self.inner.state).stats.total_stale += 1;
                self.discard(job, "stale", JobOutcome::Stale);
                continue;
            }

            if let (Some(job_session), Some(current)) = (&job.session_id, &lane_session) {
                if job_session != current {
                    debug!(target: "tts.lane", job = %job.id, job_session = %job_session, session = %current, "Discarding job from superseded session");
                    lock(&self.inner.state).stats.total_session_mismatch += 1;
                    self.discard(job, "session_mismatch", JobOutcome::SessionMismatch);
                    continue;
                }
            }

            self.play(job).await;
        }
    }

    fn discard(&self, job: QueuedJob, reason: &str, outcome: JobOutcome) {
        self.inner.bus.emit(
            names::TTS_PLAY_END,
            json!({ "jobId": job.id, "success": false, "reason": reason }),
        );
        let _ = job.done.send(outcome);
    }

    async fn play(&self, job: QueuedJob) {
        let QueuedJob {
            id,
            text,
            executor,
            done,
            ..
        } = job;
        let cancel = CancellationToken::new();
        lock(&self.inner.state).current = Some(CurrentJob {
            id: id.clone(),
            text: text.clone(),
            cancel: cancel.clone(),
        });

        self.inner.bus.emit(
            names::TTS_PLAY_START,
            json!({ "jobId": id, "textPreview": preview(&text, 50) }),
        );

        // Separate task so a panicking executor cannot take the lane down
        let result = match tokio::spawn(executor(cancel)).await {
            Ok(result) => result,
            Err(join_error) => Err(TtsError::Playback(format!(
                "speech job panicked: {}",
                join_error
            ))),
        };

        let outcome = {
            let mut st = lock(&self.inner.state);
            st.current = None;
            match &result {
                Ok(()) => {
                    st.stats.total_played += 1;
                    JobOutcome::Played
                }
                Err(e) if e.is_abort() => {
                    st.stats.total_aborted += 1;
                    JobOutcome::Aborted
                }
                Err(e) => {
                    st.stats.total_failed += 1;
                    JobOutcome::Failed(e.to_string())
                }
            }
        };

        match &outcome {
            JobOutcome::Played => {
                self.inner
                    .bus
                    .emit(names::TTS_PLAY_END, json!({ "jobId": id, "success": true }));
            }
            JobOutcome::Failed(message) => {
                warn!(target: "tts.lane", job = %id, error = %message, "Job failed");
                self.inner
                    .bus
                    .emit(names::TTS_PLAY_ERROR, json!({ "jobId": id, "error": message }));
            }
            _ => info!(target: "tts.lane", job = %id, "Job aborted"),
        }
        let _ = done.send(outcome);
    }

    /// Cancel the playing job; with `clear_queue`, also drop everything pending.
    pub fn stop(&self, clear_queue: bool) {
        let dropped: Vec<QueuedJob> = {
            let mut st = lock(&self.inner.state);
            if let Some(current) = &st.current {
                current.cancel.cancel();
            }
            if clear_queue {
                let dropped: Vec<QueuedJob> = st.queue.drain(..).collect();
                st.stats.total_skipped += dropped.len() as u64;
                dropped
            } else {
                Vec::new()
            }
        };
        info!(target: "tts.lane", cleared = clear_queue, dropped = dropped.len(), "Stopped");
        for job in dropped {
            let _ = job.done.send(JobOutcome::Dropped);
        }
    }

    /// Tag later jobs with `session_id` and validate dequeued jobs against it.
    /// Already-queued jobs are filtered lazily when they reach the head.
    pub fn set_session_id(&self, session_id: Option<String>) {
        debug!(target: "tts.lane", session = ?session_id, "Session changed");
        lock(&self.inner.state).session_id = session_id;
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.state).session_id.clone()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.inner.state).is_playing
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Resolve once the lane has nothing playing.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.playing.subscribe();
        let _ = rx.wait_for(|playing| !*playing).await;
    }

    pub fn status(&self) -> LaneStatus {
        let st = lock(&self.inner.state);
        LaneStatus {
            is_playing: st.is_playing,
            queue_length: st.queue.len(),
            session_id: st.session_id.clone(),
            current_job: st.current.as_ref().map(|c| CurrentJobInfo {
                id: c.id.clone(),
                text: preview(&c.text, 30),
            }),
            stats: st.stats.clone(),
        }
    }

    fn transition(&self) -> TransitionGuard<'_> {
        let me = Arc::as_ptr(&self.inner) as usize;
        let previous = HELD_TRANSITION.with(|held| held.get());
        if previous == me {
            return TransitionGuard {
                held: None,
                previous,
            };
        }
        let guard = lock(&self.inner.transition);
        HELD_TRANSITION.with(|held| held.set(me));
        TransitionGuard {
            held: Some(guard),
            previous,
        }
    }

    fn notify_state(&self, activity: LaneActivity) {
        let callback = lock(&self.inner.on_state_change).clone();
        if let Some(cb) = callback {
            cb(activity);
        }
    }
}
