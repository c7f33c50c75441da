//! 스트림별 처리 통계
//!
//! 각 스테이지가 원자적 카운터를 증가시키고, [`PipelineStats::snapshot`]으로
//! 일관된 시점 값을 읽습니다. 전역 `metrics` 레코더와 별개로 스트림 단위 값을 제공합니다.

use std::sync::atomic::{AtomicU64, Ordering};

/// 스트림 처리 카운터
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_read: AtomicU64,
    frames_skipped: AtomicU64,
    decode_errors: AtomicU64,
    annotation_failures: AtomicU64,
    enqueued: AtomicU64,
    commits: AtomicU64,
    indexed: AtomicU64,
    resent: AtomicU64,
    dropped: AtomicU64,
}

/// 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// 디코드된 프레임
    pub frames_read: u64,
    /// 공백 라인으로 버려진 프레임
    pub frames_skipped: u64,
    /// 디코드 에러
    pub decode_errors: u64,
    /// 패턴 불일치
    pub annotation_failures: u64,
    /// 배치에 추가된 레코드
    pub enqueued: u64,
    /// 커밋 횟수 (빈 플러시 제외)
    pub commits: u64,
    /// 색인 성공
    pub indexed: u64,
    /// 재전송
    pub resent: u64,
    /// 버려진 아이템
    pub dropped: u64,
}

macro_rules! incr {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("`", stringify!($field), "` 카운터를 증가시킵니다.")]
            pub fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineStats {
    incr! {
        add_frames_read => frames_read,
        add_frames_skipped => frames_skipped,
        add_decode_errors => decode_errors,
        add_annotation_failures => annotation_failures,
        add_enqueued => enqueued,
        add_commits => commits,
        add_indexed => indexed,
        add_resent => resent,
        add_dropped => dropped,
    }

    /// 현재 값을 읽습니다.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            annotation_failures: self.annotation_failures.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
