use loom_tts::event::names;
use loom_tts::{Alert, AlertConfig, EventBus, Result, TtsAlertManager};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn manager(cooldown: Duration) -> (EventBus, Arc<TtsAlertManager>) {
    let bus = EventBus::new();
    let mgr = TtsAlertManager::new(
        bus.clone(),
        AlertConfig {
            window_size: Duration::from_secs(60),
            min_samples: 5,
            error_rate_threshold: 0.5,
            cooldown,
        },
    );
    (bus, mgr)
}

fn collect(mgr: &TtsAlertManager) -> Arc<Mutex<Vec<Alert>>> {
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let sink = alerts.clone();
    mgr.on_alert(move |alert| sink.lock().unwrap().push(alert.clone()));
    alerts
}

#[tokio::test]
async fn no_alert_below_min_samples() -> Result<()> {
    let (_bus, mgr) = manager(Duration::from_secs(30));
    let alerts = collect(&mgr);
    for _ in 0..4 {
        mgr.record(false);
    }
    assert!(alerts.lock().unwrap().is_empty());
    assert_eq!(mgr.status().sample_size, 4);
    assert_eq!(mgr.status().error_rate, 1.0);
    Ok(())
}

#[tokio::test]
async fn repeated_breaches_alert_once_per_cooldown() -> Result<()> {
    let (bus, mgr) = manager(Duration::from_secs(30));
    let alerts = collect(&mgr);
    let (_sub, mut bus_alerts) = bus.subscribe_channel(names::TTS_ALERT);

    for _ in 0..5 {
        mgr.record(false);
    }
    // Crosses the threshold again inside the cooldown window
    for _ in 0..5 {
        mgr.record(false);
    }

    let alerts = alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    match &alerts[0] {
        Alert::HighErrorRate {
            rate,
            failures,
            total,
            ..
        } => {
            assert_eq!(*rate, 1.0);
            assert_eq!(*failures, 5);
            assert_eq!(*total, 5);
        }
        other => panic!("unexpected alert {:?}", other),
    }
    let event = bus_alerts.try_recv().expect("bus alert");
    assert_eq!(event.payload["type"], "high_error_rate");
    assert!(bus_alerts.try_recv().is_err());
    assert!(mgr.status().last_alert_ms.is_some());
    Ok(())
}

#[tokio::test]
async fn alerts_again_after_cooldown() -> Result<()> {
    let (_bus, mgr) = manager(Duration::from_millis(20));
    let alerts = collect(&mgr);
    for _ in 0..5 {
        mgr.record(false);
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    mgr.record(false);
    assert_eq!(alerts.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn healthy_traffic_stays_quiet() -> Result<()> {
    let (_bus, mgr) = manager(Duration::from_secs(30));
    let alerts = collect(&mgr);
    for i in 0..10 {
        mgr.record(i % 3 != 0);
    }
    assert!(alerts.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn circuit_open_sets_degraded_mode_until_closed() -> Result<()> {
    let (bus, mgr) = manager(Duration::from_secs(30));
    let alerts = collect(&mgr);
    let _subs = mgr.attach();

    bus.emit(
        names::TTS_CIRCUIT_OPEN,
        json!({ "name": "tts-cloud", "until": 1_700_000_000_000i64, "cooldownMs": 15000 }),
    );
    assert!(mgr.is_degraded());
    let first = alerts.lock().unwrap()[0].clone();
    match first {
        Alert::CircuitOpen {
            provider,
            cooldown_ms,
            until_ms,
            ..
        } => {
            assert_eq!(provider, "tts-cloud");
            assert_eq!(cooldown_ms, 15_000);
            assert_eq!(until_ms, Some(1_700_000_000_000));
        }
        other => panic!("unexpected alert {:?}", other),
    }
    assert_eq!(mgr.status().open_circuits, vec!["tts-cloud".to_string()]);

    bus.emit(names::TTS_CIRCUIT_CLOSE, json!({ "name": "tts-cloud" }));
    assert!(!mgr.is_degraded());
    Ok(())
}

#[tokio::test]
async fn playback_events_feed_the_window() -> Result<()> {
    let (bus, mgr) = manager(Duration::from_secs(30));
    let _subs = mgr.attach();

    bus.emit(names::TTS_PLAY_END, json!({ "jobId": "job-1", "success": true }));
    bus.emit(names::TTS_PLAY_ERROR, json!({ "jobId": "job-2", "error": "boom" }));
    // Discards are not synthesis outcomes
    bus.emit(
        names::TTS_PLAY_END,
        json!({ "jobId": "job-3", "success": false, "reason": "stale" }),
    );

    let status = mgr.status();
    assert_eq!(status.sample_size, 2);
    assert_eq!(status.error_rate, 0.5);

    mgr.reset();
    assert_eq!(mgr.status().sample_size, 0);
    Ok(())
}
