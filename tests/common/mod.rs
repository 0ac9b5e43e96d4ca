#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use spindle_proxy::config::types::{ProxyConfig, Settings};
use spindle_proxy::error::ProxyError;
use spindle_proxy::server::ProxyState;
use spindle_proxy::storage::settings::SettingsRepository;
use spindle_proxy::storage::{
    Protocol, RequestLogStore, RequestRecord, Upstream, UpstreamFilter, UpstreamRepository,
    UpstreamStatus,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

pub fn upstream(id: i64, address: &str) -> Upstream {
    Upstream {
        id,
        address: address.to_string(),
        protocol: Protocol::Http,
        username: None,
        password: None,
        status: UpstreamStatus::Active,
        requests: 0,
        successful_requests: 0,
        failed_requests: 0,
        avg_response_time_ms: 0,
        last_check_at: None,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub struct MemoryRepository {
    pub upstreams: Mutex<Vec<Upstream>>,
}

impl MemoryRepository {
    pub fn with(upstreams: Vec<Upstream>) -> Arc<Self> {
        Arc::new(Self {
            upstreams: Mutex::new(upstreams),
        })
    }

    pub fn snapshot(&self) -> Vec<Upstream> {
        self.upstreams.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamRepository for MemoryRepository {
    async fn list_upstreams(&self, filter: &UpstreamFilter) -> Result<Vec<Upstream>, ProxyError> {
        let mut rows: Vec<Upstream> = self
            .upstreams
            .lock()
            .unwrap()
            .iter()
            .filter(|u| filter.statuses.is_empty() || filter.statuses.contains(&u.status))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(rows)
    }

    async fn increment_counters(
        &self,
        upstream_id: i64,
        success: bool,
        latency_ms: i64,
    ) -> Result<(), ProxyError> {
        let mut rows = self.upstreams.lock().unwrap();
        if let Some(u) = rows.iter_mut().find(|u| u.id == upstream_id) {
            u.requests += 1;
            if success {
                u.successful_requests += 1;
                u.avg_response_time_ms = if u.avg_response_time_ms == 0 {
                    latency_ms
                } else {
                    (u.avg_response_time_ms + latency_ms) / 2
                };
            } else {
                u.failed_requests += 1;
            }
        }
        Ok(())
    }

    async fn set_status(
        &self,
        upstream_id: i64,
        status: UpstreamStatus,
        last_error: Option<&str>,
    ) -> Result<(), ProxyError> {
        let mut rows = self.upstreams.lock().unwrap();
        if let Some(u) = rows.iter_mut().find(|u| u.id == upstream_id) {
            u.status = status;
            u.last_error = last_error.map(|s| s.to_string());
        }
        Ok(())
    }
}

pub struct MemoryRequestLog {
    pub counts: Mutex<HashMap<i64, i64>>,
}

impl MemoryRequestLog {
    pub fn with_counts(counts: &[(i64, i64)]) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(counts.iter().copied().collect()),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::with_counts(&[])
    }
}

#[async_trait]
impl RequestLogStore for MemoryRequestLog {
    async fn append(&self, record: &RequestRecord) -> Result<(), ProxyError> {
        if record.success {
            *self
                .counts
                .lock()
                .unwrap()
                .entry(record.upstream_id)
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn count_by_upstream(
        &self,
        upstream_ids: &[i64],
        _since_seconds: u64,
        _success_only: bool,
    ) -> Result<HashMap<i64, i64>, ProxyError> {
        let counts = self.counts.lock().unwrap();
        Ok(upstream_ids
            .iter()
            .filter_map(|id| counts.get(id).map(|c| (*id, *c)))
            .collect())
    }
}

pub struct MemorySettings {
    record: Mutex<(Settings, i64)>,
}

impl MemorySettings {
    pub fn with(settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new((settings, 1)),
        })
    }
}

#[async_trait]
impl SettingsRepository for MemorySettings {
    async fn load(&self) -> Result<Option<(Settings, i64)>, ProxyError> {
        let record = self.record.lock().unwrap();
        Ok(Some((record.0.clone(), record.1)))
    }

    async fn current_version(&self) -> Result<Option<i64>, ProxyError> {
        Ok(Some(self.record.lock().unwrap().1))
    }

    async fn save(&self, settings: &Settings) -> Result<i64, ProxyError> {
        let mut record = self.record.lock().unwrap();
        record.0 = settings.clone();
        record.1 += 1;
        Ok(record.1)
    }
}

pub async fn build_state(
    config: ProxyConfig,
    upstreams: Vec<Upstream>,
    settings: Settings,
) -> (
    ProxyState,
    Arc<MemoryRepository>,
    Arc<MemoryRequestLog>,
    Arc<MemorySettings>,
) {
    let repo = MemoryRepository::with(upstreams);
    let log = MemoryRequestLog::empty();
    let settings_repo = MemorySettings::with(settings);
    let state = ProxyState::new(
        Arc::new(config),
        repo.clone(),
        log.clone(),
        settings_repo.clone(),
    )
    .await
    .expect("state builds");
    (state, repo, log, settings_repo)
}

/// Reserve a local port by binding to :0 and immediately releasing it.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Run the proxy listener on a fresh local port; returns its address and the
/// shutdown handle.
pub async fn spawn_proxy(state: ProxyState) -> (SocketAddr, Arc<Notify>) {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let shutdown = Arc::new(Notify::new());
    let listen = addr.to_string();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        let _ = spindle_proxy::server::run_proxy_server(
            &listen,
            state,
            shutdown_clone,
            std::time::Duration::from_secs(5),
        )
        .await;
    });

    // Wait until the listener accepts.
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return (addr, shutdown);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("proxy listener never came up on {}", addr);
}

/// Send one raw HTTP/1.1 request with `Connection: close` and return
/// `(status, head, body)`.
pub async fn raw_request(addr: SocketAddr, request: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head terminator");
    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let body = raw[head_end + 4..].to_vec();

    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code in response line");
    (status, head, body)
}

/// Read an HTTP response head (through the blank line) from a stream that
/// stays open afterwards — used by CONNECT clients.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before response head ended");
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            return String::from_utf8_lossy(&head).to_string();
        }
        assert!(head.len() < 16 * 1024, "response head too large");
    }
}
