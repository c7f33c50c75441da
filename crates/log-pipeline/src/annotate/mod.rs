//! 라인 주석 — 프레임을 색인 문서로 변환
//!
//! [`LineAnnotator`]는 스트림 시작 시 패턴을 한 번 컴파일하고,
//! 이후 라인마다 캡처 결과를 만듭니다. 패턴 문법 오류는 시작 단계에서 실패하며,
//! 라인 불일치는 레코드 단위 진단으로 남고 레코드는 그대로 전달됩니다.
//!
//! [`AnnotatorStage`]는 리더 채널에서 프레임을 받아 [`LogRecord`]를 만들고
//! 커밋 워커들에 라운드로빈으로 분배합니다.

pub mod grok;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use eslog_core::metrics as m;

pub use grok::{GrokMatcher, PatternSet};

use crate::config::GrokOpts;
use crate::error::LogPipelineError;
use crate::reader::RawFrame;
use crate::record::{ContainerMetadata, LogRecord};
use crate::stats::PipelineStats;

/// 불일치 진단 메시지
pub const NO_MATCH: &str = "pattern does not match";

/// 한 라인의 주석 결과
#[derive(Debug)]
pub struct Annotation {
    /// 캡처 맵 또는 진단 맵
    pub fields: Option<BTreeMap<String, String>>,
    /// 문서 `message`로 남길 원본 라인 (주석 비활성일 때만)
    pub message: Option<String>,
    /// 레코드 단위 에러 (레코드는 계속 전달됨)
    pub error: Option<LogPipelineError>,
}

/// 라인 주석기
#[derive(Debug, Clone, Default)]
pub struct LineAnnotator {
    matcher: Option<Arc<GrokMatcher>>,
}

impl LineAnnotator {
    /// 주석 없이 라인을 그대로 전달합니다.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// 컴파일된 표현식으로 주석기를 만듭니다.
    pub fn with_matcher(matcher: GrokMatcher) -> Self {
        Self {
            matcher: Some(Arc::new(matcher)),
        }
    }

    /// 옵션에서 패턴 테이블을 구성하고 매칭 표현식을 컴파일합니다.
    ///
    /// `grok-match`가 비어 있으면 패턴 옵션은 무시됩니다.
    pub async fn from_opts(opts: &GrokOpts) -> Result<Self, LogPipelineError> {
        if !opts.is_enabled() {
            return Ok(Self::passthrough());
        }

        let mut set = PatternSet::with_defaults();
        if !opts.pattern.is_empty() {
            set.add_inline(&opts.pattern, &opts.splitter)?;
        }
        if !opts.pattern_from.is_empty() {
            set.load_path(&opts.pattern_from).await?;
        }
        let matcher = set.compile(&opts.match_expr, opts.named_capture_only)?;
        debug!(expr = matcher.as_str(), patterns = set.added(), "compiled line pattern");
        Ok(Self::with_matcher(matcher))
    }

    /// 주석이 설정되었는지 여부
    pub fn is_enabled(&self) -> bool {
        self.matcher.is_some()
    }

    /// 라인에 패턴을 적용합니다.
    pub fn annotate(&self, line: &str) -> Annotation {
        let Some(matcher) = &self.matcher else {
            return Annotation {
                fields: None,
                message: Some(line.to_owned()),
                error: None,
            };
        };

        match matcher.captures(line) {
            Some(captures) => Annotation {
                fields: Some(captures),
                message: None,
                error: None,
            },
            None => {
                let mut diag = BTreeMap::new();
                diag.insert("line".to_owned(), line.to_owned());
                diag.insert("err".to_owned(), NO_MATCH.to_owned());
                Annotation {
                    fields: Some(diag),
                    message: None,
                    error: Some(LogPipelineError::NoMatch(line.to_owned())),
                }
            }
        }
    }
}

/// 주석 스테이지
pub struct AnnotatorStage {
    annotator: LineAnnotator,
    metadata: Arc<ContainerMetadata>,
    stream_id: Arc<str>,
    stats: Arc<PipelineStats>,
}

impl AnnotatorStage {
    /// 스테이지를 만듭니다.
    pub fn new(
        annotator: LineAnnotator,
        metadata: Arc<ContainerMetadata>,
        stream_id: Arc<str>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            annotator,
            metadata,
            stream_id,
            stats,
        }
    }

    /// 입력 채널이 닫힐 때까지 레코드를 만들어 워커들에 분배합니다.
    ///
    /// 반환 시 모든 워커 송신측이 drop되어 워커가 드레인을 시작합니다.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<RawFrame>,
        workers: Vec<mpsc::Sender<LogRecord>>,
        cancel: CancellationToken,
    ) -> Result<(), LogPipelineError> {
        if workers.is_empty() {
            return Err(LogPipelineError::Channel("no bulk workers".to_owned()));
        }
        let mut next = 0usize;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let line = String::from_utf8_lossy(&frame.line);
            let annotation = self.annotator.annotate(&line);
            if let Some(e) = &annotation.error {
                self.stats.add_annotation_failures(1);
                metrics::counter!(m::ANNOTATOR_FAILURES_TOTAL).increment(1);
                warn!(stream_id = %self.stream_id, stage = "annotator", error = %e, "could not annotate line");
            }
            let record = LogRecord::new(
                Arc::clone(&self.metadata),
                &frame,
                annotation.message,
                annotation.fields,
            );

            let worker = &workers[next];
            next = (next + 1) % workers.len();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = worker.send(record) => {
                    if sent.is_err() {
                        return Err(LogPipelineError::Channel(
                            "bulk worker stopped before input ended".to_owned(),
                        ));
                    }
                }
            }
        }

        debug!(stream_id = %self.stream_id, "annotator input closed");
        Ok(())
    }
}
