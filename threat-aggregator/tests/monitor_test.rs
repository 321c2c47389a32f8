mod common;

use common::{raw_entry, source, FlakySink, OverlapClock, StaticFeedSource, VirtualClock};
use std::sync::Arc;
use std::time::Duration;
use threat_aggregator::{
    MemorySink, MockInferenceBackend, MonitorConfig, MonitorState, PersistenceSink, ThreatAnalyzer, ThreatMonitor,
    ThreatType,
};
use tracing::info;

const AI_REPLY: &str = r#"{"summary": "AI summary", "threat_type": "vulnerability", "severity": "high", "key_points": ["p"], "recommendations": ["r"]}"#;

fn config(names: &[&str]) -> MonitorConfig {
    MonitorConfig {
        sources: names.iter().map(|n| source(n)).collect(),
        source_interval_seconds: 5,
        cycle_interval_seconds: 10,
    }
}

fn two_source_feed() -> StaticFeedSource {
    StaticFeedSource::new()
        .with_feed(
            "https://alpha.test/feed",
            vec![
                raw_entry("Ransomware hits clinic", "https://alpha.test/1", "Contact 185.220.101.47 for ransom"),
                raw_entry("Patch released", "https://alpha.test/2", "Fixes CVE-2024-3400"),
            ],
        )
        .with_feed(
            "https://beta.test/feed",
            vec![raw_entry("Phishing wave", "https://beta.test/1", "Scam pages at evil-bank.net")],
        )
}

#[tokio::test]
async fn test_run_cycle_processes_sources_in_order() -> anyhow::Result<()> {
    common::init_tracing();

    let feed = Arc::new(two_source_feed());
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(VirtualClock::new());
    let monitor = ThreatMonitor::with_clock(
        config(&["alpha", "beta"]),
        feed.clone(),
        Arc::new(ThreatAnalyzer::offline()),
        sink.clone(),
        clock.clone(),
    );

    let report = monitor.run_cycle().await;
    info!("Cycle report: {:?}", report);

    assert_eq!(report.sources_processed, 2);
    assert_eq!(report.entries_seen, 3);
    assert_eq!(report.records_stored, 3);
    assert_eq!(report.sources_failed, 0);
    assert_eq!(feed.fetched_urls(), vec!["https://alpha.test/feed", "https://beta.test/feed"]);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(5), Duration::from_secs(5)]);

    let records = sink.records().await;
    let urls: Vec<_> = records.iter().map(|r| r.entry.url.as_str()).collect();
    assert_eq!(urls, vec!["https://alpha.test/1", "https://alpha.test/2", "https://beta.test/1"]);

    assert_eq!(records[0].analysis.threat_type, ThreatType::Ransomware);
    assert_eq!(records[0].iocs.values(threat_aggregator::IocType::Ip), vec!["185.220.101.47"]);
    assert_eq!(records[0].entry.source_id, "https://alpha.test/feed");
    assert_eq!(records[2].analysis.threat_type, ThreatType::Phishing);

    assert_eq!(monitor.state().await, MonitorState::Idle);

    Ok(())
}

#[tokio::test]
async fn test_known_urls_skipped_on_next_cycle() -> anyhow::Result<()> {
    common::init_tracing();

    let feed = Arc::new(two_source_feed());
    let sink = Arc::new(MemorySink::new());
    let backend = Arc::new(MockInferenceBackend::replying("tinyllama", AI_REPLY));
    let monitor = ThreatMonitor::with_clock(
        config(&["alpha", "beta"]),
        feed.clone(),
        Arc::new(ThreatAnalyzer::new(backend.clone())),
        sink.clone(),
        Arc::new(VirtualClock::new()),
    );

    let first = monitor.run_cycle().await;
    let second = monitor.run_cycle().await;

    assert_eq!(first.records_stored, 3);
    assert_eq!(second.records_stored, 0);
    assert_eq!(second.entries_skipped, 3);
    assert_eq!(backend.prompts().len(), 3);
    assert_eq!(sink.len().await, 3);

    let fetches = feed.fetches();
    assert_eq!(fetches[0].1, None);
    assert!(fetches[2].1.is_some());
    assert!(monitor.last_seen("https://alpha.test/feed").await.is_some());

    let stats = monitor.stats().await?;
    assert_eq!(stats.total_threats, 3);
    assert_eq!(stats.ai_analyzed, 3);
    assert_eq!(stats.recent_threats, 3);
    assert!((stats.analysis_coverage() - 100.0).abs() < 1e-9);

    Ok(())
}

#[tokio::test]
async fn test_unavailable_backend_skips_generation() -> anyhow::Result<()> {
    common::init_tracing();

    let backend = Arc::new(MockInferenceBackend::replying("tinyllama", AI_REPLY).with_availability(false));
    let sink = Arc::new(MemorySink::new());
    let monitor = ThreatMonitor::with_clock(
        config(&["alpha"]),
        Arc::new(two_source_feed()),
        Arc::new(ThreatAnalyzer::new(backend.clone())),
        sink.clone(),
        Arc::new(VirtualClock::new()),
    );

    monitor.run_cycle().await;

    assert!(backend.prompts().is_empty());
    assert!(sink.records().await.iter().all(|r| r.analysis.is_fallback()));

    let stats = sink.stats().await?;
    assert_eq!(stats.fallback_analyzed, 2);
    assert_eq!(stats.ai_analyzed, 0);

    Ok(())
}

#[tokio::test]
async fn test_failing_entry_does_not_stop_cycle() -> anyhow::Result<()> {
    common::init_tracing();

    let sink = Arc::new(FlakySink::new("alpha.test/1"));
    let monitor = ThreatMonitor::with_clock(
        config(&["alpha", "missing", "beta"]),
        Arc::new(two_source_feed()),
        Arc::new(ThreatAnalyzer::offline()),
        sink.clone(),
        Arc::new(VirtualClock::new()),
    );

    let report = monitor.run_cycle().await;

    assert_eq!(report.sources_processed, 3);
    assert_eq!(report.sources_failed, 1);
    assert_eq!(report.entries_failed, 1);
    assert_eq!(report.records_stored, 2);

    let urls: Vec<_> = sink.records().await.into_iter().map(|r| r.entry.url).collect();
    assert_eq!(urls, vec!["https://alpha.test/2", "https://beta.test/1"]);

    Ok(())
}

#[tokio::test]
async fn test_start_stop_lifecycle() -> anyhow::Result<()> {
    common::init_tracing();

    let feed = Arc::new(two_source_feed());
    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(VirtualClock::new());
    let monitor = ThreatMonitor::with_clock(
        config(&["alpha", "beta"]),
        feed.clone(),
        Arc::new(ThreatAnalyzer::offline()),
        sink.clone(),
        clock.clone(),
    );

    assert_eq!(monitor.state().await, MonitorState::Idle);

    monitor.start().await;
    monitor.start().await;
    assert_eq!(monitor.state().await, MonitorState::Running);

    tokio::time::timeout(Duration::from_secs(5), async {
        while clock.sleeps().len() < 6 {
            tokio::task::yield_now().await;
        }
    })
    .await?;

    monitor.stop().await;
    tokio::time::timeout(Duration::from_secs(5), monitor.join()).await?;
    assert!(!monitor.is_running().await);

    // two sources then a cycle pause, repeated
    let sleeps = clock.sleeps();
    assert_eq!(
        &sleeps[..6],
        &[
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(10),
        ]
    );

    // a single loop: fetches stay in source order and nothing is stored twice
    let urls = feed.fetched_urls();
    for pair in urls.chunks(2).filter(|c| c.len() == 2) {
        assert_eq!(pair[0], "https://alpha.test/feed");
        assert_eq!(pair[1], "https://beta.test/feed");
    }
    assert_eq!(sink.len().await, 3);

    // stopped loops stay stopped
    let fetch_count = feed.fetches().len();
    tokio::task::yield_now().await;
    assert_eq!(feed.fetches().len(), fetch_count);

    Ok(())
}

#[tokio::test]
async fn test_restart_without_join_keeps_single_loop() -> anyhow::Result<()> {
    common::init_tracing();

    let clock = Arc::new(OverlapClock::new(Duration::from_millis(40)));
    let sink = Arc::new(MemorySink::new());
    let monitor = ThreatMonitor::with_clock(
        config(&["alpha", "beta"]),
        Arc::new(two_source_feed()),
        Arc::new(ThreatAnalyzer::offline()),
        sink.clone(),
        clock.clone(),
    );

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    // the first loop is still mid-sleep when the second start arrives
    monitor.stop().await;
    monitor.start().await;
    assert_eq!(monitor.state().await, MonitorState::Running);

    tokio::time::sleep(Duration::from_millis(300)).await;
    monitor.stop().await;
    tokio::time::timeout(Duration::from_secs(5), monitor.join()).await?;

    info!("{} sleeps, at most {} at once", clock.total_sleeps(), clock.max_sleeping());
    assert!(clock.total_sleeps() > 2);
    assert_eq!(clock.max_sleeping(), 1, "two monitoring loops ran at once");
    assert_eq!(monitor.state().await, MonitorState::Idle);
    assert_eq!(sink.len().await, 3);

    Ok(())
}

#[tokio::test]
async fn test_join_waits_for_stopped_loop_only() -> anyhow::Result<()> {
    common::init_tracing();

    let clock = Arc::new(OverlapClock::new(Duration::from_millis(20)));
    let monitor = ThreatMonitor::with_clock(
        config(&["alpha"]),
        Arc::new(two_source_feed()),
        Arc::new(ThreatAnalyzer::offline()),
        Arc::new(MemorySink::new()),
        clock.clone(),
    );

    // nothing to wait for before the first start
    monitor.join().await;
    monitor.stop().await;
    assert_eq!(monitor.state().await, MonitorState::Idle);

    monitor.start().await;
    monitor.stop().await;
    tokio::time::timeout(Duration::from_secs(5), monitor.join()).await?;

    let sleeps_after_join = clock.total_sleeps();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(clock.total_sleeps(), sleeps_after_join);

    Ok(())
}
