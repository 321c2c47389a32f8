#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use threat_aggregator::{
    FeedSource, MemorySink, PacingClock, PersistenceSink, RawEntry, SinkStats, SourceSpec, ThreatRecord,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn raw_entry(title: &str, link: &str, body: &str) -> RawEntry {
    RawEntry {
        title: Some(title.to_string()),
        link: Some(link.to_string()),
        summary: Some(body.to_string()),
        ..RawEntry::default()
    }
}

pub fn source(name: &str) -> SourceSpec {
    SourceSpec::new(name, &format!("https://{}.test/feed", name))
}

/// Serves fixed entries per URL and records every fetch.
#[derive(Default)]
pub struct StaticFeedSource {
    feeds: HashMap<String, Vec<RawEntry>>,
    fetches: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
}

impl StaticFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(mut self, url: &str, entries: Vec<RawEntry>) -> Self {
        self.feeds.insert(url.to_string(), entries);
        self
    }

    pub fn fetches(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetches().into_iter().map(|(url, _)| url).collect()
    }
}

#[async_trait]
impl FeedSource for StaticFeedSource {
    async fn fetch(&self, url: &str, last_seen: Option<DateTime<Utc>>) -> Vec<RawEntry> {
        self.fetches.lock().unwrap().push((url.to_string(), last_seen));
        self.feeds.get(url).cloned().unwrap_or_default()
    }
}

/// Records requested sleeps instead of waiting.
#[derive(Default)]
pub struct VirtualClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

#[async_trait]
impl PacingClock for VirtualClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Memory sink that refuses to store URLs containing a marker.
pub struct FlakySink {
    inner: MemorySink,
    poison: String,
}

impl FlakySink {
    pub fn new(poison: &str) -> Self {
        Self {
            inner: MemorySink::new(),
            poison: poison.to_string(),
        }
    }

    pub async fn records(&self) -> Vec<ThreatRecord> {
        self.inner.records().await
    }
}

#[async_trait]
impl PersistenceSink for FlakySink {
    async fn contains_url(&self, url: &str) -> anyhow::Result<bool> {
        self.inner.contains_url(url).await
    }

    async fn store(&self, record: &ThreatRecord) -> anyhow::Result<bool> {
        if record.entry.url.contains(&self.poison) {
            anyhow::bail!("write refused for {}", record.entry.url);
        }
        self.inner.store(record).await
    }

    async fn stats(&self) -> anyhow::Result<SinkStats> {
        self.inner.stats().await
    }
}

/// Sleeps for real and tracks how many callers are asleep at once.
pub struct OverlapClock {
    pause: Duration,
    sleeping: AtomicUsize,
    max_sleeping: AtomicUsize,
    total_sleeps: AtomicUsize,
}

impl OverlapClock {
    pub fn new(pause: Duration) -> Self {
        Self {
            pause,
            sleeping: AtomicUsize::new(0),
            max_sleeping: AtomicUsize::new(0),
            total_sleeps: AtomicUsize::new(0),
        }
    }

    pub fn max_sleeping(&self) -> usize {
        self.max_sleeping.load(Ordering::SeqCst)
    }

    pub fn total_sleeps(&self) -> usize {
        self.total_sleeps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacingClock for OverlapClock {
    async fn sleep(&self, _duration: Duration) {
        let now_sleeping = self.sleeping.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_sleeping.fetch_max(now_sleeping, Ordering::SeqCst);
        self.total_sleeps.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.pause).await;
        self.sleeping.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Minimal HTTP/1.1 server answering every request with the same status and
/// JSON body. Returns its base URL.
pub async fn spawn_http_stub(status: u16, body: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = body.to_string();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Consume headers and a `Content-Length` body.
async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let Ok(n) = socket.read(&mut chunk).await else { return };
        if n == 0 {
            return;
        }
        received.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&received);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if received.len() >= header_end + 4 + content_length {
                return;
            }
        }
    }
}
