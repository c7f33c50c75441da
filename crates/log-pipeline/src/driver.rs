//! 스트림 레지스트리 — `StartLogging`/`StopLogging` 처리
//!
//! [`LogDriver`]는 스트림 키(로그 파일 경로의 base name)마다 최대 하나의
//! [`PipelineHandle`]을 보관합니다. 같은 키로 두 번 시작하면 에러입니다.
//!
//! 시작 절차:
//! 1. 키 예약 (동시에 들어온 같은 키의 시작 요청은 여기서 거부)
//! 2. 로그 옵션 검증, 주석 패턴 컴파일
//! 3. 백엔드 연결
//! 4. FIFO 열기, 파이프라인 시작
//!
//! 어느 단계든 실패하면 예약을 풀고 에러를 돌려줍니다.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::{info, warn};

use eslog_core::metrics as m;
use eslog_core::types::ContainerInfo;

use crate::annotate::LineAnnotator;
use crate::bulk::client::ClientFactory;
use crate::config::{LogOpts, PipelineConfig};
use crate::error::LogPipelineError;
use crate::pipeline::{PipelineHandle, PipelineSupervisor};
use crate::record::ContainerMetadata;
use crate::stats::StatsSnapshot;

/// 드라이버가 지원하는 기능
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    /// 로그 재조회 지원 여부
    pub read_logs: bool,
}

/// 호스트 플러그인 프로토콜이 호출하는 드라이버 동작
pub trait LoggingDriver: Send + Sync + 'static {
    /// 컨테이너 로그 스트림을 시작합니다.
    fn start_logging(
        &self,
        file: &str,
        info: &ContainerInfo,
    ) -> impl Future<Output = Result<(), LogPipelineError>> + Send;

    /// 스트림을 멈추고 남은 레코드를 플러시합니다.
    fn stop_logging(&self, file: &str) -> impl Future<Output = Result<(), LogPipelineError>> + Send;

    /// 지원 기능
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

enum Slot {
    Starting,
    Running(Arc<PipelineHandle>),
    /// 종료 요청을 받았고 최종 플러시가 아직 끝나지 않음
    Stopping(Arc<PipelineHandle>),
}

type Registry = Mutex<HashMap<String, Slot>>;

/// 스트림 레지스트리
pub struct LogDriver<F> {
    factory: F,
    config: PipelineConfig,
    streams: Registry,
}

impl<F: ClientFactory> LogDriver<F> {
    /// 빈 레지스트리를 만듭니다.
    pub fn new(factory: F, config: PipelineConfig) -> Self {
        Self {
            factory,
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// 호스트가 준 FIFO 경로로 스트림을 시작합니다.
    pub async fn start_logging(
        &self,
        file: &str,
        info: &ContainerInfo,
    ) -> Result<(), LogPipelineError> {
        let path = file.to_owned();
        self.start(file, info, move || open_fifo(&path)).await
    }

    /// 이미 열린 스트림으로 시작합니다. `key`는 파일 경로 규칙을 그대로 따릅니다.
    pub async fn start_with_stream<R>(
        &self,
        key: &str,
        info: &ContainerInfo,
        stream: R,
    ) -> Result<(), LogPipelineError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.start(key, info, move || Ok(stream)).await
    }

    async fn start<R, O>(
        &self,
        file: &str,
        info: &ContainerInfo,
        open: O,
    ) -> Result<(), LogPipelineError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        O: FnOnce() -> Result<R, LogPipelineError>,
    {
        let key = stream_key(file);
        let reservation = Reservation::acquire(&self.streams, &key)?;

        match self.launch(&key, info, open).await {
            Ok(handle) => {
                info!(
                    stream_id = %key,
                    container_id = %info.short_id(),
                    container_name = %info.name(),
                    index = %handle.index_name(),
                    "logger started"
                );
                reservation.commit(handle);
                self.publish_active();
                Ok(())
            }
            Err(e) => {
                warn!(
                    stream_id = %key,
                    container_id = %info.short_id(),
                    error = %e,
                    "logger failed to start"
                );
                metrics::counter!(m::DRIVER_START_FAILURES_TOTAL).increment(1);
                Err(e)
            }
        }
    }

    async fn launch<R, O>(
        &self,
        key: &str,
        info: &ContainerInfo,
        open: O,
    ) -> Result<PipelineHandle, LogPipelineError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        O: FnOnce() -> Result<R, LogPipelineError>,
    {
        let opts = LogOpts::parse(&info.config)?;
        let annotator = LineAnnotator::from_opts(&opts.grok).await?;
        let metadata = ContainerMetadata::select(&opts.fields, info);
        let client = self.factory.connect(&opts).await?;
        let stream = open()?;

        Ok(PipelineSupervisor::new(
            key,
            self.config.clone(),
            opts,
            annotator,
            metadata,
            client,
        )
        .spawn(stream))
    }

    /// 스트림을 멈추고 최종 플러시가 끝날 때까지 기다립니다.
    ///
    /// 플러시가 끝날 때까지 스트림은 종료 중 상태로 레지스트리에 남습니다.
    /// 호출이 중간에 취소되어도 [`shutdown`](Self::shutdown)이나 같은 키의
    /// 다음 `stop_logging`이 그 플러시를 이어서 기다립니다.
    pub async fn stop_logging(&self, file: &str) -> Result<(), LogPipelineError> {
        let key = stream_key(file);
        let handle = {
            let mut streams = lock(&self.streams);
            let handle = match streams.get(&key) {
                Some(Slot::Running(handle) | Slot::Stopping(handle)) => Arc::clone(handle),
                Some(Slot::Starting) | None => {
                    return Err(LogPipelineError::StreamNotFound(key));
                }
            };
            streams.insert(key.clone(), Slot::Stopping(Arc::clone(&handle)));
            handle
        };
        self.publish_active();

        info!(stream_id = %key, "stopping logger");
        handle.stop().await;
        {
            let mut streams = lock(&self.streams);
            if matches!(streams.get(&key), Some(Slot::Stopping(h)) if Arc::ptr_eq(h, &handle)) {
                streams.remove(&key);
            }
        }
        let stats = handle.stats();
        info!(
            stream_id = %key,
            indexed = stats.indexed,
            dropped = stats.dropped,
            "logger stopped"
        );
        Ok(())
    }

    /// 종료 중인 것을 포함해 모든 스트림을 멈춥니다.
    pub async fn stop_all(&self) {
        let handles = self.take_live();
        if handles.is_empty() {
            return;
        }
        info!(streams = handles.len(), "stopping all loggers");
        futures::future::join_all(handles.iter().map(|h| h.stop())).await;
    }

    /// `grace` 안에 모든 스트림을 멈추고, 넘기면 남은 스트림을 중단시킵니다.
    ///
    /// 이미 종료 중인 스트림의 플러시도 함께 기다립니다.
    /// 시간 안에 모두 플러시되었으면 `true`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let handles = self.take_live();
        if handles.is_empty() {
            return true;
        }
        info!(streams = handles.len(), grace_secs = grace.as_secs(), "shutting down loggers");
        let stops = futures::future::join_all(handles.iter().map(|h| h.stop()));
        if tokio::time::timeout(grace, stops).await.is_ok() {
            return true;
        }

        warn!(streams = handles.len(), "shutdown grace period elapsed, cancelling loggers");
        for handle in &handles {
            handle.cancel();
        }
        false
    }

    fn take_live(&self) -> Vec<Arc<PipelineHandle>> {
        let handles: Vec<Arc<PipelineHandle>> = {
            let mut streams = lock(&self.streams);
            let keys: Vec<String> = streams
                .iter()
                .filter(|(_, slot)| !matches!(slot, Slot::Starting))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| match streams.remove(key) {
                    Some(Slot::Running(handle) | Slot::Stopping(handle)) => Some(handle),
                    _ => None,
                })
                .collect()
        };
        self.publish_active();
        handles
    }

    /// 실행 중인 스트림 키 (정렬됨)
    pub fn active_streams(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.streams)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// 스트림 하나의 통계 (종료 중인 스트림 포함)
    pub fn stats(&self, file: &str) -> Option<StatsSnapshot> {
        match lock(&self.streams).get(&stream_key(file)) {
            Some(Slot::Running(handle) | Slot::Stopping(handle)) => Some(handle.stats()),
            _ => None,
        }
    }

    fn publish_active(&self) {
        let active = lock(&self.streams)
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count();
        metrics::gauge!(m::DRIVER_ACTIVE_STREAMS).set(active as f64);
    }
}

impl<F: ClientFactory> LoggingDriver for LogDriver<F> {
    async fn start_logging(&self, file: &str, info: &ContainerInfo) -> Result<(), LogPipelineError> {
        LogDriver::start_logging(self, file, info).await
    }

    async fn stop_logging(&self, file: &str) -> Result<(), LogPipelineError> {
        LogDriver::stop_logging(self, file).await
    }
}

/// 파일 경로의 base name. 경로 요소가 없으면 입력 그대로.
pub fn stream_key(file: &str) -> String {
    Path::new(file)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_owned())
}

fn lock(streams: &Registry) -> MutexGuard<'_, HashMap<String, Slot>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 시작 중인 키의 예약. 커밋되지 않고 drop되면 키를 풉니다.
struct Reservation<'a> {
    streams: &'a Registry,
    key: String,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn acquire(streams: &'a Registry, key: &str) -> Result<Self, LogPipelineError> {
        let mut map = lock(streams);
        match map.get(key) {
            None => {}
            // 기다리던 호출이 취소된 채 플러시가 끝난 자리
            Some(Slot::Stopping(handle)) if handle.is_stopped() => {}
            Some(_) => return Err(LogPipelineError::StreamExists(key.to_owned())),
        }
        map.insert(key.to_owned(), Slot::Starting);
        Ok(Self {
            streams,
            key: key.to_owned(),
            committed: false,
        })
    }

    fn commit(mut self, handle: PipelineHandle) {
        lock(self.streams).insert(self.key.clone(), Slot::Running(Arc::new(handle)));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            lock(self.streams).remove(&self.key);
        }
    }
}

/// 호스트가 만든 FIFO를 엽니다.
///
/// 읽기/쓰기로 열어 작성자가 붙기 전의 EOF를 피합니다.
#[cfg(target_os = "linux")]
fn open_fifo(path: &str) -> Result<tokio::net::unix::pipe::Receiver, LogPipelineError> {
    tokio::net::unix::pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .map_err(LogPipelineError::Io)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn open_fifo(path: &str) -> Result<tokio::net::unix::pipe::Receiver, LogPipelineError> {
    tokio::net::unix::pipe::OpenOptions::new()
        .open_receiver(path)
        .map_err(LogPipelineError::Io)
}

#[cfg(not(unix))]
fn open_fifo(_path: &str) -> Result<tokio::io::Empty, LogPipelineError> {
    Err(LogPipelineError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "named pipes require a unix host",
    )))
}
