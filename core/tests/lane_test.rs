use loom_tts::event::names;
use loom_tts::{
    EventBus, JobOutcome, LaneActivity, LaneConfig, Priority, Result, SpeechJob, SpeechLane,
    TtsError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn lane() -> (EventBus, SpeechLane) {
    let bus = EventBus::new();
    let lane = SpeechLane::new(bus.clone(), LaneConfig::default());
    (bus, lane)
}

fn recording_job(text: &str, log: Arc<Mutex<Vec<String>>>) -> SpeechJob {
    let label = text.to_string();
    SpeechJob::new(text, move |_cancel| async move {
        log.lock().unwrap().push(label);
        Ok(())
    })
}

#[tokio::test]
async fn high_priority_jumps_ahead_of_normals() -> Result<()> {
    let (_bus, lane) = lane();
    let log = Arc::new(Mutex::new(Vec::new()));

    lane.enqueue(recording_job("A", log.clone())).expect("A");
    lane.enqueue(recording_job("B", log.clone()).with_priority(Priority::High))
        .expect("B");
    lane.enqueue(recording_job("C", log.clone())).expect("C");

    lane.wait_idle().await;
    assert_eq!(*log.lock().unwrap(), vec!["B", "A", "C"]);
    Ok(())
}

#[tokio::test]
async fn highs_stay_fifo_among_themselves() -> Result<()> {
    let (_bus, lane) = lane();
    let log = Arc::new(Mutex::new(Vec::new()));

    lane.enqueue(recording_job("n1", log.clone()));
    lane.enqueue(recording_job("h1", log.clone()).with_priority(Priority::High));
    lane.enqueue(recording_job("l1", log.clone()).with_priority(Priority::Low));
    lane.enqueue(recording_job("h2", log.clone()).with_priority(Priority::High));

    lane.wait_idle().await;
    assert_eq!(*log.lock().unwrap(), vec!["h1", "h2", "n1", "l1"]);
    Ok(())
}

#[tokio::test]
async fn jobs_never_overlap() -> Result<()> {
    let (_bus, lane) = lane();
    let active = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));

    let mut tickets = Vec::new();
    for i in 0..4 {
        let active = active.clone();
        let overlapped = overlapped.clone();
        let job = SpeechJob::new(format!("job {}", i), move |_cancel| async move {
            if active.swap(true, Ordering::SeqCst) {
                overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            active.store(false, Ordering::SeqCst);
            Ok(())
        });
        tickets.push(lane.enqueue(job).expect("accepted"));
    }

    for ticket in tickets {
        assert_eq!(ticket.outcome().await, JobOutcome::Played);
    }
    assert!(!overlapped.load(Ordering::SeqCst));
    assert_eq!(lane.status().stats.total_played, 4);
    Ok(())
}

#[tokio::test]
async fn stale_job_is_discarded_without_running() -> Result<()> {
    let (bus, lane) = lane();
    let (_sub, mut ends) = bus.subscribe_channel(names::TTS_PLAY_END);
    let ran = Arc::new(AtomicBool::new(false));

    // Blocks the lane long enough for the next job to go stale
    let blocker = SpeechJob::new("blocker", |_cancel| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(())
    });
    lane.enqueue(blocker).expect("blocker");

    let flag = ran.clone();
    let stale = SpeechJob::new("late news", move |_cancel| async move {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    })
    .with_max_age(Duration::from_millis(100));
    let ticket = lane.enqueue(stale).expect("stale");

    assert_eq!(ticket.outcome().await, JobOutcome::Stale);
    assert!(!ran.load(Ordering::SeqCst));

    let _blocker_end = ends.recv().await.expect("blocker end");
    let stale_end = ends.recv().await.expect("stale end");
    assert_eq!(stale_end.payload["success"], false);
    assert_eq!(stale_end.payload["reason"], "stale");
    assert_eq!(lane.status().stats.total_stale, 1);
    Ok(())
}

#[tokio::test]
async fn session_change_invalidates_queued_jobs() -> Result<()> {
    let (bus, lane) = lane();
    let (_sub, mut ends) = bus.subscribe_channel(names::TTS_PLAY_END);
    let ran = Arc::new(AtomicBool::new(false));

    lane.set_session_id(Some("s1".into()));
    let flag = ran.clone();
    let ticket = lane
        .enqueue(SpeechJob::new("old task", move |_cancel| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .expect("accepted");
    // Before the spawned drain gets to run
    lane.set_session_id(Some("s2".into()));

    assert_eq!(ticket.outcome().await, JobOutcome::SessionMismatch);
    assert!(!ran.load(Ordering::SeqCst));
    let end = ends.recv().await.expect("end event");
    assert_eq!(end.payload["reason"], "session_mismatch");
    Ok(())
}

#[tokio::test]
async fn job_without_session_survives_session_change() -> Result<()> {
    let (_bus, lane) = lane();
    let ticket = lane
        .enqueue(SpeechJob::new("untagged", |_cancel| async { Ok(()) }))
        .expect("accepted");
    lane.set_session_id(Some("s9".into()));
    assert_eq!(ticket.outcome().await, JobOutcome::Played);
    Ok(())
}

#[tokio::test]
async fn skip_if_busy_rejects_when_queue_full() -> Result<()> {
    let bus = EventBus::new();
    let lane = SpeechLane::new(
        bus,
        LaneConfig {
            max_queue_size: 2,
            default_max_age: Duration::from_secs(8),
        },
    );

    for i in 0..2 {
        lane.enqueue(SpeechJob::new(format!("{}", i), |_c| async { Ok(()) }));
    }
    assert_eq!(lane.queue_len(), 2);

    let rejected = lane.enqueue(SpeechJob::new("chatter", |_c| async { Ok(()) }).skip_if_busy(true));
    assert!(rejected.is_none());
    // Essential speech is still accepted
    assert!(lane
        .enqueue(SpeechJob::new("important", |_c| async { Ok(()) }))
        .is_some());
    lane.wait_idle().await;
    Ok(())
}

#[tokio::test]
async fn failure_emits_play_error_and_lane_continues() -> Result<()> {
    let (bus, lane) = lane();
    let (_sub, mut errors) = bus.subscribe_channel(names::TTS_PLAY_ERROR);

    let failed = lane
        .enqueue(SpeechJob::new("broken", |_c| async {
            Err(TtsError::AllProvidersFailed)
        }))
        .expect("accepted");
    let next = lane
        .enqueue(SpeechJob::new("fine", |_c| async { Ok(()) }))
        .expect("accepted");

    assert!(matches!(failed.outcome().await, JobOutcome::Failed(_)));
    assert_eq!(next.outcome().await, JobOutcome::Played);
    let error = errors.recv().await.expect("error event");
    assert_eq!(error.payload["error"], "All TTS providers failed");
    Ok(())
}

#[tokio::test]
async fn panicking_executor_is_reported_as_failure() -> Result<()> {
    let (_bus, lane) = lane();
    let ticket = lane
        .enqueue(SpeechJob::new("boom", |_c| async {
            if "boom".len() == 4 {
                panic!("executor bug");
            }
            Ok(())
        }))
        .expect("accepted");
    assert!(matches!(ticket.outcome().await, JobOutcome::Failed(_)));
    assert!(lane
        .enqueue(SpeechJob::new("after", |_c| async { Ok(()) }))
        .is_some());
    lane.wait_idle().await;
    assert_eq!(lane.status().stats.total_played, 1);
    Ok(())
}

#[tokio::test]
async fn stop_aborts_current_and_clears_queue() -> Result<()> {
    let (bus, lane) = lane();
    let (_sub, mut errors) = bus.subscribe_channel(names::TTS_PLAY_ERROR);
    let (_sub2, mut starts) = bus.subscribe_channel(names::TTS_PLAY_START);

    let current = lane
        .enqueue(SpeechJob::new("long", |cancel| async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(TtsError::aborted()),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
            }
        }))
        .expect("accepted");
    let pending = lane
        .enqueue(SpeechJob::new("pending", |_c| async { Ok(()) }))
        .expect("accepted");

    starts.recv().await.expect("started");
    lane.stop(true);

    assert_eq!(current.outcome().await, JobOutcome::Aborted);
    assert_eq!(pending.outcome().await, JobOutcome::Dropped);
    lane.wait_idle().await;
    // Abort is not an error
    assert!(errors.try_recv().is_err());
    let stats = lane.status().stats;
    assert_eq!(stats.total_aborted, 1);
    assert_eq!(stats.total_skipped, 1);
    Ok(())
}

#[tokio::test]
async fn state_callback_and_events_bracket_playback() -> Result<()> {
    let (bus, lane) = lane();
    let states = Arc::new(Mutex::new(Vec::new()));
    let s = states.clone();
    lane.on_state_change(move |activity| s.lock().unwrap().push(activity));
    let (_q, mut queued) = bus.subscribe_channel(names::TTS_QUEUE_ADD);
    let (_s, mut started) = bus.subscribe_channel(names::TTS_PLAY_START);

    let ticket = lane
        .enqueue(SpeechJob::new("你好，今天天气很好", |_c| async { Ok(()) }))
        .expect("accepted");
    assert!(lane.is_busy());
    let job_id = ticket.id().to_string();
    ticket.outcome().await;
    lane.wait_idle().await;

    let add = queued.try_recv().expect("queue add");
    assert_eq!(add.payload["jobId"], job_id.as_str());
    assert_eq!(add.payload["queueLength"], 1);
    let start = started.try_recv().expect("play start");
    assert_eq!(start.payload["textPreview"], "你好，今天天气很好");

    // Idle is signalled once the drain loop exits
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        *states.lock().unwrap(),
        vec![LaneActivity::Playing, LaneActivity::Idle]
    );
    assert!(!lane.is_busy());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn state_changes_stay_ordered_across_threads() -> Result<()> {
    let (_bus, lane) = lane();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let idle_while_busy = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        let idle_while_busy = idle_while_busy.clone();
        let observed = lane.clone();
        lane.on_state_change(move |activity| {
            if activity == LaneActivity::Idle && observed.is_busy() {
                idle_while_busy.fetch_add(1, Ordering::SeqCst);
            }
            seen.lock().unwrap().push(activity);
        });
    }

    const ROUNDS: usize = 2_000;
    for _ in 0..ROUNDS {
        let ticket = lane
            .enqueue(SpeechJob::new("tick", |_c| async { Ok(()) }))
            .expect("accepted");
        assert_eq!(ticket.outcome().await, JobOutcome::Played);
        lane.wait_idle().await;
    }

    assert_eq!(idle_while_busy.load(Ordering::SeqCst), 0);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), ROUNDS * 2);
    for pair in seen.chunks(2) {
        assert_eq!(pair, [LaneActivity::Playing, LaneActivity::Idle]);
    }
    Ok(())
}

#[tokio::test]
async fn idle_callback_may_queue_more_speech() -> Result<()> {
    let (_bus, lane) = lane();
    let log = Arc::new(Mutex::new(Vec::new()));
    let requeued = Arc::new(AtomicBool::new(false));
    {
        let handle = lane.clone();
        let log = log.clone();
        let requeued = requeued.clone();
        lane.on_state_change(move |activity| {
            if activity == LaneActivity::Idle && !requeued.swap(true, Ordering::SeqCst) {
                handle.enqueue(recording_job("follow-up", log.clone()));
            }
        });
    }

    lane.enqueue(recording_job("first", log.clone())).expect("first");
    lane.wait_idle().await;
    assert_eq!(*log.lock().unwrap(), vec!["first", "follow-up"]);
    assert!(!lane.is_busy());
    Ok(())
}
