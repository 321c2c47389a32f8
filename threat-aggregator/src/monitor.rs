//! Cycle scheduler: repeatedly walks the configured sources and runs each
//! entry through normalize, extract, analyze and store.

use crate::analyzer::{fallback_analysis, ThreatAnalyzer};
use crate::ioc::IocExtractor;
use crate::normalizer::normalize;
use crate::types::{
    FeedEntry, FeedSource, MonitorConfig, PacingClock, PersistenceSink, RawEntry, SinkStats, SourceSpec, ThreatRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Running,
}

/// Counters for one pass over the source list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub sources_processed: usize,
    /// Sources where at least one entry could not be checked or stored.
    pub sources_failed: usize,
    pub entries_seen: usize,
    pub records_stored: usize,
    /// Entries whose URL the sink already held.
    pub entries_skipped: usize,
    pub entries_failed: usize,
    /// The pass ended early because the monitor was stopped.
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct SourceOutcome {
    seen: usize,
    stored: usize,
    skipped: usize,
    failed: usize,
}

/// Real-time pacing.
pub struct TokioClock;

#[async_trait]
impl PacingClock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Everything the background loop needs, shared with the spawned task.
struct MonitorCore {
    config: MonitorConfig,
    source: Arc<dyn FeedSource>,
    analyzer: Arc<ThreatAnalyzer>,
    sink: Arc<dyn PersistenceSink>,
    clock: Arc<dyn PacingClock>,
    extractor: IocExtractor,
    last_seen: RwLock<HashMap<String, DateTime<Utc>>>,
}

/// One spawned monitoring loop and the stop flag only it reads.
struct LoopRun {
    is_running: Arc<RwLock<bool>>,
    task: Option<JoinHandle<()>>,
}

pub struct ThreatMonitor {
    core: Arc<MonitorCore>,
    run: Mutex<Option<LoopRun>>,
}

impl ThreatMonitor {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn FeedSource>,
        analyzer: Arc<ThreatAnalyzer>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self::with_clock(config, source, analyzer, sink, Arc::new(TokioClock))
    }

    pub fn with_clock(
        config: MonitorConfig,
        source: Arc<dyn FeedSource>,
        analyzer: Arc<ThreatAnalyzer>,
        sink: Arc<dyn PersistenceSink>,
        clock: Arc<dyn PacingClock>,
    ) -> Self {
        let core = MonitorCore {
            config,
            source,
            analyzer,
            sink,
            clock,
            extractor: IocExtractor::new(),
            last_seen: RwLock::new(HashMap::new()),
        };

        Self {
            core: Arc::new(core),
            run: Mutex::new(None),
        }
    }

    /// Spawn the monitoring loop. Calling it while already running only logs
    /// a warning. After a `stop()`, waits for the previous loop to exit so
    /// at most one loop is ever active.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;

        if let Some(current) = run.as_ref() {
            if *current.is_running.read().await {
                warn!("Threat monitor is already running");
                return;
            }
        }

        if let Some(previous) = run.take().and_then(|r| r.task) {
            if !previous.is_finished() {
                info!("Waiting for the previous monitor loop to exit");
            }
            if let Err(e) = previous.await {
                error!("Threat monitor task ended abnormally: {}", e);
            }
        }

        info!("Starting threat monitor with {} sources", self.core.config.sources.len());

        let is_running = Arc::new(RwLock::new(true));
        let core = self.core.clone();
        let loop_flag = is_running.clone();
        let task = tokio::spawn(async move {
            core.run_loop(&loop_flag).await;
        });

        *run = Some(LoopRun {
            is_running,
            task: Some(task),
        });
    }

    /// Ask the loop to finish. It exits at the next source or cycle boundary;
    /// in-flight work completes first.
    pub async fn stop(&self) {
        let run = self.run.lock().await;
        if let Some(current) = run.as_ref() {
            let mut is_running = current.is_running.write().await;
            if *is_running {
                info!("Stopping threat monitor");
            }
            *is_running = false;
        }
    }

    /// Wait for the background task, if any, to exit.
    pub async fn join(&self) {
        let task = self.run.lock().await.as_mut().and_then(|r| r.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Threat monitor task ended abnormally: {}", e);
            }
        }
    }

    pub async fn state(&self) -> MonitorState {
        let run = self.run.lock().await;
        let Some(current) = run.as_ref() else {
            return MonitorState::Idle;
        };

        if *current.is_running.read().await {
            MonitorState::Running
        } else {
            MonitorState::Idle
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == MonitorState::Running
    }

    /// One pass over every source, independent of the background loop.
    pub async fn run_cycle(&self) -> CycleReport {
        self.core.run_cycle(None).await
    }

    pub async fn stats(&self) -> anyhow::Result<SinkStats> {
        self.core.sink.stats().await
    }

    pub async fn last_seen(&self, url: &str) -> Option<DateTime<Utc>> {
        self.core.last_seen.read().await.get(url).copied()
    }
}

impl MonitorCore {
    async fn run_loop(&self, is_running: &RwLock<bool>) {
        let cycle_interval = Duration::from_secs(self.config.cycle_interval_seconds);
        let mut cycle = 0u64;

        while *is_running.read().await {
            cycle += 1;
            let report = self.run_cycle(Some(is_running)).await;
            info!(
                "Cycle {} complete: {} sources, {} entries, {} stored, {} already known, {} failed",
                cycle,
                report.sources_processed,
                report.entries_seen,
                report.records_stored,
                report.entries_skipped,
                report.entries_failed
            );

            if !*is_running.read().await {
                break;
            }
            self.clock.sleep(cycle_interval).await;
        }

        info!("Threat monitor stopped after {} cycles", cycle);
    }

    /// With a stop flag, the flag is checked before each source.
    async fn run_cycle(&self, stop_flag: Option<&RwLock<bool>>) -> CycleReport {
        let source_interval = Duration::from_secs(self.config.source_interval_seconds);
        let mut report = CycleReport::default();

        for spec in &self.config.sources {
            if let Some(flag) = stop_flag {
                if !*flag.read().await {
                    report.interrupted = true;
                    break;
                }
            }

            let outcome = self.process_source(spec).await;
            report.sources_processed += 1;
            report.entries_seen += outcome.seen;
            report.records_stored += outcome.stored;
            report.entries_skipped += outcome.skipped;
            report.entries_failed += outcome.failed;
            if outcome.failed > 0 {
                report.sources_failed += 1;
            }

            self.clock.sleep(source_interval).await;
        }

        report
    }

    async fn process_source(&self, spec: &SourceSpec) -> SourceOutcome {
        info!("Processing source: {} ({})", spec.name, spec.url);
        let mut outcome = SourceOutcome::default();

        let last_seen = self.last_seen.read().await.get(&spec.url).copied();
        let fetch_started = Utc::now();
        let raw_entries = self.source.fetch(&spec.url, last_seen).await;
        if raw_entries.is_empty() {
            debug!("No entries from {}", spec.name);
            return outcome;
        }
        self.last_seen.write().await.insert(spec.url.clone(), fetch_started);

        let use_backend = self.analyzer.is_backend_available().await;
        if !use_backend {
            warn!("Inference backend unavailable, using fallback analysis for {}", spec.name);
        }

        for raw in &raw_entries {
            outcome.seen += 1;
            match self.process_entry(raw, &spec.url, use_backend).await {
                Ok(Some(true)) => outcome.stored += 1,
                Ok(Some(false)) | Ok(None) => outcome.skipped += 1,
                Err(e) => {
                    error!("Failed to process entry from {}: {}", spec.name, e);
                    outcome.failed += 1;
                }
            }
        }

        info!(
            "Source {}: {} entries, {} stored, {} skipped",
            spec.name, outcome.seen, outcome.stored, outcome.skipped
        );
        outcome
    }

    /// `Ok(None)` when the sink already had the URL, otherwise whether the
    /// store call added it.
    async fn process_entry(&self, raw: &RawEntry, source_id: &str, use_backend: bool) -> anyhow::Result<Option<bool>> {
        let entry = normalize(raw, source_id);
        if !entry.url.is_empty() && self.sink.contains_url(&entry.url).await? {
            debug!("Already stored: {}", entry.url);
            return Ok(None);
        }

        let record = self.enrich(entry, use_backend).await;
        let stored = self.sink.store(&record).await?;
        Ok(Some(stored))
    }

    async fn enrich(&self, entry: FeedEntry, use_backend: bool) -> ThreatRecord {
        let iocs = self.extractor.extract(&entry.body);
        let analysis = if use_backend {
            self.analyzer.analyze(&entry.title, &entry.body).await
        } else {
            fallback_analysis(&entry.title, &entry.body)
        };

        debug!(
            "Entry '{}': {} IOCs, {} / {}",
            entry.title,
            iocs.total(),
            analysis.threat_type,
            analysis.severity
        );

        ThreatRecord {
            entry,
            iocs,
            analysis,
            ingested_at: Utc::now(),
        }
    }
}
