//! bulk 커밋 워커
//!
//! 워커 하나가 자기 [`BulkBatcher`]와 플러시 타이머를 소유합니다.
//! 레코드를 받을 때마다 임계값을 확인하고, 타이머가 울리면 쌓인 만큼 커밋합니다.
//! 입력 채널이 닫히면 남은 배치를 최종 플러시합니다 (재전송 포함 최대 3회).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eslog_core::metrics as m;

use crate::config::BulkOpts;
use crate::error::LogPipelineError;
use crate::index::IndexNameCell;
use crate::record::LogRecord;
use crate::stats::PipelineStats;

use super::BulkBatcher;
use super::client::BulkClient;
use super::retry::{CommitOutcome, RetryPolicy};

/// 최종 플러시 최대 반복 횟수
const FINAL_FLUSH_ROUNDS: usize = 3;

/// 워커 설정
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// 액션 수 임계값
    pub actions: Option<usize>,
    /// 예상 크기 임계값
    pub size: Option<usize>,
    /// 주기적 플러시 간격
    pub flush_interval: Duration,
    /// 커밋마다 통계 로그
    pub log_stats: bool,
    /// 문서 타입
    pub doc_type: String,
}

impl WorkerSettings {
    /// bulk 옵션과 문서 타입으로 설정을 만듭니다.
    pub fn from_opts(bulk: &BulkOpts, doc_type: &str) -> Self {
        Self {
            actions: bulk.actions,
            size: bulk.size,
            flush_interval: bulk.flush_interval,
            log_stats: bulk.stats,
            doc_type: doc_type.to_owned(),
        }
    }
}

/// bulk 커밋 워커
pub struct BulkWorker<C> {
    id: usize,
    client: Arc<C>,
    policy: RetryPolicy,
    index: Arc<IndexNameCell>,
    settings: WorkerSettings,
    batcher: BulkBatcher,
    stream_id: Arc<str>,
    stats: Arc<PipelineStats>,
    backend: &'static str,
}

impl<C: BulkClient> BulkWorker<C> {
    /// 워커를 만듭니다.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        client: Arc<C>,
        policy: RetryPolicy,
        index: Arc<IndexNameCell>,
        settings: WorkerSettings,
        stream_id: Arc<str>,
        stats: Arc<PipelineStats>,
        backend: &'static str,
    ) -> Self {
        Self {
            id,
            client,
            policy,
            index,
            settings,
            batcher: BulkBatcher::new(),
            stream_id,
            stats,
            backend,
        }
    }

    /// 입력 채널이 닫힐 때까지 레코드를 배치로 커밋합니다.
    ///
    /// `cancel`이 발동하면 최종 플러시 없이 종료합니다.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<LogRecord>,
        cancel: CancellationToken,
    ) -> Result<(), LogPipelineError> {
        let period = self.settings.flush_interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if !self.batcher.is_empty() {
                        warn!(
                            stream_id = %self.stream_id,
                            worker = self.id,
                            pending = self.batcher.len(),
                            "pipeline cancelled, discarding pending batch"
                        );
                        self.record_dropped(self.batcher.len());
                    }
                    return Ok(());
                }
                record = rx.recv() => match record {
                    Some(record) => {
                        self.enqueue(&record);
                        if self
                            .batcher
                            .should_commit(self.settings.actions, self.settings.size)
                        {
                            self.flush(&cancel).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush(&cancel).await,
            }
        }

        for round in 0..FINAL_FLUSH_ROUNDS {
            if self.batcher.is_empty() {
                break;
            }
            debug!(
                stream_id = %self.stream_id,
                worker = self.id,
                round,
                pending = self.batcher.len(),
                "final flush"
            );
            self.flush(&cancel).await;
        }
        if !self.batcher.is_empty() {
            error!(
                stream_id = %self.stream_id,
                worker = self.id,
                pending = self.batcher.len(),
                "items still rejected after final flush, dropping"
            );
            self.record_dropped(self.batcher.len());
        }
        Ok(())
    }

    fn enqueue(&mut self, record: &LogRecord) {
        let index = self.index.current();
        match self.batcher.add(&index, &self.settings.doc_type, record) {
            Ok(()) => {
                self.stats.add_enqueued(1);
                metrics::counter!(m::BULK_RECORDS_ENQUEUED_TOTAL).increment(1);
            }
            Err(e) => {
                error!(
                    stream_id = %self.stream_id,
                    worker = self.id,
                    error = %e,
                    "could not serialize record, dropping"
                );
                self.record_dropped(1);
            }
        }
    }

    async fn flush(&mut self, cancel: &CancellationToken) {
        if self.batcher.is_empty() {
            return;
        }
        let batch = self.batcher.drain();
        let items = batch.len();
        let started = Instant::now();
        let outcome = self.policy.commit(self.client.as_ref(), batch, cancel).await;
        let elapsed = started.elapsed();

        self.stats.add_commits(1);
        metrics::counter!(
            m::BULK_COMMITS_TOTAL,
            m::LABEL_RESULT => outcome.label(),
            m::LABEL_BACKEND_VERSION => self.backend,
        )
        .increment(1);
        metrics::histogram!(m::BULK_COMMIT_DURATION_SECONDS).record(elapsed.as_secs_f64());

        match outcome {
            CommitOutcome::Committed { indexed } => self.record_indexed(indexed),
            CommitOutcome::PartialFailure {
                indexed,
                resend,
                dropped,
            } => {
                self.record_indexed(indexed);
                self.record_dropped(dropped);
                if !resend.is_empty() {
                    self.stats.add_resent(resend.len() as u64);
                    metrics::counter!(m::BULK_ITEMS_RESENT_TOTAL).increment(resend.len() as u64);
                    self.batcher.requeue(resend);
                }
            }
            CommitOutcome::Failed { dropped } => self.record_dropped(dropped),
        }

        if self.settings.log_stats {
            let snap = self.stats.snapshot();
            info!(
                stream_id = %self.stream_id,
                worker = self.id,
                items,
                took_ms = elapsed.as_millis() as u64,
                pending = self.batcher.len(),
                commits = snap.commits,
                indexed = snap.indexed,
                resent = snap.resent,
                dropped = snap.dropped,
                "bulk stats"
            );
        }
    }

    fn record_indexed(&self, n: usize) {
        self.stats.add_indexed(n as u64);
        metrics::counter!(m::BULK_ITEMS_INDEXED_TOTAL).increment(n as u64);
    }

    fn record_dropped(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.stats.add_dropped(n as u64);
        metrics::counter!(m::BULK_ITEMS_DROPPED_TOTAL).increment(n as u64);
    }
}
