//! 스트림별 파이프라인 감독
//!
//! [`PipelineSupervisor`]는 컨테이너 로그 스트림 하나에 대해 세 스테이지를
//! 독립 태스크로 띄우고 bounded 채널로 연결합니다.
//!
//! # 내부 아키텍처
//! ```text
//! FrameReader -> mpsc -> AnnotatorStage -+-> mpsc -> BulkWorker 0 -+
//!                                        +-> mpsc -> BulkWorker 1 -+-> BulkClient
//!                                        +-> ...                   |
//!                                                                   v
//!                                            supervisor: join -> client.stop()
//! ```
//!
//! # 종료
//! - `close` 토큰: 정상 종료. 리더가 남은 프레임을 읽고 출력 채널을 닫으면
//!   주석 스테이지와 워커가 차례로 드레인하고, 워커는 최종 플러시를 합니다.
//! - `cancel` 토큰: 스테이지 실패. 모든 스테이지가 현재 대기 지점에서 빠져나옵니다.
//!
//! 모든 태스크가 끝난 뒤에만 클라이언트를 정리합니다.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::annotate::{AnnotatorStage, LineAnnotator};
use crate::bulk::client::BulkClient;
use crate::bulk::retry::RetryPolicy;
use crate::bulk::worker::{BulkWorker, WorkerSettings};
use crate::config::{LogOpts, PipelineConfig};
use crate::error::LogPipelineError;
use crate::index::IndexNameCell;
use crate::reader::{FrameReader, ReaderExit};
use crate::record::ContainerMetadata;
use crate::stats::{PipelineStats, StatsSnapshot};

/// 파이프라인 스테이지 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 프레임 리더
    Reader,
    /// 라인 주석
    Annotator,
    /// bulk 커밋 워커
    Bulk(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Annotator => write!(f, "annotator"),
            Self::Bulk(id) => write!(f, "bulk-{id}"),
        }
    }
}

type StageResult = (Stage, Result<(), LogPipelineError>);

/// 스트림 하나의 파이프라인 구성 요소
pub struct PipelineSupervisor<C> {
    stream_id: Arc<str>,
    config: PipelineConfig,
    opts: LogOpts,
    annotator: LineAnnotator,
    metadata: Arc<ContainerMetadata>,
    client: Arc<C>,
}

impl<C: BulkClient> PipelineSupervisor<C> {
    /// 구성 요소를 모읍니다. 태스크는 [`spawn`](Self::spawn)에서 시작합니다.
    pub fn new(
        stream_id: impl Into<Arc<str>>,
        config: PipelineConfig,
        opts: LogOpts,
        annotator: LineAnnotator,
        metadata: ContainerMetadata,
        client: C,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            config,
            opts,
            annotator,
            metadata: Arc::new(metadata),
            client: Arc::new(client),
        }
    }

    /// 스트림 위에 스테이지 태스크들을 띄우고 핸들을 돌려줍니다.
    pub fn spawn<R>(self, stream: R) -> PipelineHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Self {
            stream_id,
            config,
            opts,
            annotator,
            metadata,
            client,
        } = self;

        let close = CancellationToken::new();
        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());
        let index = Arc::new(IndexNameCell::new(opts.index.clone(), Utc::now()));
        let capacity = config.channel_capacity.max(1);
        let workers = opts.bulk.workers.max(1);

        let mut tasks: JoinSet<StageResult> = JoinSet::new();

        // reader -> annotator
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let reader = FrameReader::new(stream, &config, Arc::clone(&stream_id), Arc::clone(&stats));
        {
            let close = close.clone();
            let cancel = cancel.clone();
            let stream_id = Arc::clone(&stream_id);
            tasks.spawn(async move {
                let exit = reader.run(frame_tx, close, cancel).await;
                match exit {
                    ReaderExit::Failed => {
                        error!(stream_id = %stream_id, stage = "reader", "reader terminated, draining pipeline");
                    }
                    other => debug!(stream_id = %stream_id, exit = ?other, "reader finished"),
                }
                // 리더 종료는 파이프라인 실패가 아님
                (Stage::Reader, Ok(()))
            });
        }

        // annotator -> workers
        let policy = RetryPolicy::new(
            opts.timeout,
            config.retryable_statuses.clone(),
            config.resend_delay,
        );
        let settings = WorkerSettings::from_opts(&opts.bulk, &opts.doc_type);
        let mut worker_txs = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            worker_txs.push(tx);
            let worker = BulkWorker::new(
                id,
                Arc::clone(&client),
                policy.clone(),
                Arc::clone(&index),
                settings.clone(),
                Arc::clone(&stream_id),
                Arc::clone(&stats),
                opts.version.as_str(),
            );
            let cancel = cancel.clone();
            tasks.spawn(async move { (Stage::Bulk(id), worker.run(rx, cancel).await) });
        }

        let stage = AnnotatorStage::new(
            annotator,
            metadata,
            Arc::clone(&stream_id),
            Arc::clone(&stats),
        );
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                (
                    Stage::Annotator,
                    stage.run(frame_rx, worker_txs, cancel).await,
                )
            });
        }

        info!(
            stream_id = %stream_id,
            workers,
            index = %opts.index,
            version = %opts.version,
            annotate = opts.grok.is_enabled(),
            "pipeline started"
        );

        let supervisor = tokio::spawn(supervise(
            tasks,
            cancel.clone(),
            client,
            Arc::clone(&stream_id),
        ));

        PipelineHandle {
            stream_id,
            close,
            cancel,
            stats,
            index,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }
}

/// 스테이지 태스크를 모두 기다리고, 실패가 보이면 나머지를 취소합니다.
async fn supervise<C: BulkClient>(
    mut tasks: JoinSet<StageResult>,
    cancel: CancellationToken,
    client: Arc<C>,
    stream_id: Arc<str>,
) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((stage, Ok(()))) => {
                debug!(stream_id = %stream_id, stage = %stage, "stage finished");
            }
            Ok((stage, Err(e))) => {
                error!(
                    stream_id = %stream_id,
                    stage = %stage,
                    error = %e,
                    "stage failed, cancelling pipeline"
                );
                cancel.cancel();
            }
            Err(e) => {
                error!(stream_id = %stream_id, error = %e, "stage task aborted, cancelling pipeline");
                cancel.cancel();
            }
        }
    }

    client.stop().await;
    info!(stream_id = %stream_id, "pipeline stopped");
}

/// 실행 중인 파이프라인 핸들
///
/// 레지스트리가 스트림 키마다 하나씩 보관합니다.
pub struct PipelineHandle {
    stream_id: Arc<str>,
    close: CancellationToken,
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    index: Arc<IndexNameCell>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineHandle {
    /// 정상 종료를 요청하고 최종 플러시와 클라이언트 정리가 끝날 때까지 기다립니다.
    ///
    /// 여러 번 호출해도 안전하며, 이후 호출은 첫 종료가 끝나면 바로 반환합니다.
    /// 기다리던 future가 drop되어도 태스크 핸들은 남아 있어 다음 호출이 이어서 기다립니다.
    pub async fn stop(&self) {
        self.close.cancel();
        let mut guard = self.supervisor.lock().await;
        let Some(handle) = guard.as_mut() else {
            return;
        };
        let joined = handle.await;
        *guard = None;
        if let Err(e) = joined {
            error!(stream_id = %self.stream_id, error = %e, "pipeline supervisor panicked");
        }
    }

    /// 드레인 없이 모든 스테이지를 즉시 중단시킵니다.
    ///
    /// 대기 중인 [`stop`](Self::stop)은 태스크가 빠져나오면 반환합니다.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 모든 스테이지가 끝났는지 여부
    pub async fn is_finished(&self) -> bool {
        self.supervisor
            .lock()
            .await
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// 종료가 끝나 다시 기다릴 것이 없는지 여부. 다른 호출이 기다리는 중이면 `false`.
    pub fn is_stopped(&self) -> bool {
        self.supervisor
            .try_lock()
            .is_ok_and(|guard| guard.as_ref().is_none_or(JoinHandle::is_finished))
    }

    /// 스트림 키
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// 처리 통계 스냅샷
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// 지금 쓰이는 인덱스 이름
    pub fn index_name(&self) -> String {
        self.index.current()
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("stream_id", &self.stream_id)
            .field("closing", &self.close.is_cancelled())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
