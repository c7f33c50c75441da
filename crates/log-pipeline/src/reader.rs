//! 프레임 리더 — 길이 접두사 스트림을 로그 프레임으로 디코딩
//!
//! 호스트는 named pipe에 `[u32 big-endian 길이][protobuf LogEntry]` 프레임을
//! 구분자 없이 연속으로 씁니다. [`FrameReader`]는 이를 [`RawFrame`]으로 풀어
//! 다음 스테이지 채널로 보냅니다.
//!
//! # 종료 분류
//! - EOF, 상대방이 닫은 파이프: 정상 종료
//! - 일시적 디코드 에러: 디코더를 다시 만들고 계속 (연속 `max_decode_retries`회까지)
//! - 그 외: 원인을 로그로 남기고 리더만 종료 (나머지 스테이지는 드레인 후 종료)

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use prost::Message;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eslog_core::metrics as m;

use crate::config::PipelineConfig;
use crate::stats::PipelineStats;

/// 종료 요청 후 남은 프레임을 기다리는 최대 유휴 시간
const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// 와이어 포맷의 로그 엔트리
#[derive(Clone, PartialEq, Message)]
pub struct LogEntry {
    /// `stdout` 또는 `stderr`
    #[prost(string, tag = "1")]
    pub source: String,
    /// 유닉스 나노초
    #[prost(int64, tag = "2")]
    pub time_nano: i64,
    /// 라인 바이트
    #[prost(bytes = "bytes", tag = "3")]
    pub line: Bytes,
    /// 부분 라인 여부
    #[prost(bool, tag = "4")]
    pub partial: bool,
}

/// 디코딩된 로그 프레임
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// 라인 바이트
    pub line: Bytes,
    /// 출력 스트림
    pub source: String,
    /// 유닉스 나노초
    pub timestamp_nanos: i64,
    /// 부분 라인 여부
    pub partial: bool,
}

impl From<LogEntry> for RawFrame {
    fn from(entry: LogEntry) -> Self {
        Self {
            line: entry.line,
            source: entry.source,
            timestamp_nanos: entry.time_nano,
            partial: entry.partial,
        }
    }
}

impl RawFrame {
    /// 유니코드 공백만 있는 라인인지 확인합니다.
    pub fn is_blank(&self) -> bool {
        String::from_utf8_lossy(&self.line).trim().is_empty()
    }
}

/// 엔트리를 와이어 프레임으로 인코딩합니다.
///
/// 인코딩 길이가 `u32` 길이 접두사를 넘으면 `InvalidInput` 에러입니다.
pub fn encode_frame(entry: &LogEntry) -> io::Result<Bytes> {
    let len = entry.encoded_len();
    let prefix = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {len} bytes does not fit a u32 length prefix"),
        )
    })?;
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(prefix);
    entry.encode(&mut buf).map_err(io::Error::other)?;
    Ok(buf.freeze())
}

/// 리더 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// 스트림 끝
    Eof,
    /// 상대방이 파이프를 닫음
    Closed,
    /// 종료 요청 후 남은 프레임을 모두 읽음
    Stopped,
    /// 취소 신호 또는 소비자 종료
    Cancelled,
    /// 복구할 수 없는 디코드 에러
    Failed,
}

/// 길이 접두사 프레임 리더
pub struct FrameReader<R> {
    framed: FramedRead<R, LengthDelimitedCodec>,
    max_frame_size: usize,
    max_decode_retries: u32,
    stream_id: Arc<str>,
    stats: Arc<PipelineStats>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 스트림 위에 리더를 만듭니다.
    pub fn new(
        stream: R,
        config: &PipelineConfig,
        stream_id: Arc<str>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            framed: framed(stream, config.max_frame_size),
            max_frame_size: config.max_frame_size,
            max_decode_retries: config.max_decode_retries,
            stream_id,
            stats,
        }
    }

    /// 스트림이 끝날 때까지 프레임을 읽어 `tx`로 보냅니다.
    ///
    /// `close`가 발동하면 이미 도착한 프레임을 마저 읽은 뒤 종료합니다.
    /// `cancel`은 즉시 종료합니다.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<RawFrame>,
        close: CancellationToken,
        cancel: CancellationToken,
    ) -> ReaderExit {
        let mut consecutive_errors = 0u32;
        let mut draining = false;

        loop {
            if cancel.is_cancelled() {
                return ReaderExit::Cancelled;
            }

            let next = if draining {
                match timeout(DRAIN_IDLE, self.framed.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(stream_id = %self.stream_id, "stream idle after stop request");
                        return ReaderExit::Stopped;
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ReaderExit::Cancelled,
                    _ = close.cancelled() => {
                        draining = true;
                        continue;
                    }
                    next = self.framed.next() => next,
                }
            };

            let frame = match next {
                None => {
                    debug!(stream_id = %self.stream_id, "log stream reached eof");
                    return ReaderExit::Eof;
                }
                Some(Err(e)) if is_peer_closed(&e) => {
                    debug!(stream_id = %self.stream_id, error = %e, "log stream closed by writer");
                    return ReaderExit::Closed;
                }
                Some(Err(e)) => {
                    consecutive_errors += 1;
                    self.stats.add_decode_errors(1);
                    metrics::counter!(m::READER_DECODE_ERRORS_TOTAL).increment(1);
                    if consecutive_errors > self.max_decode_retries {
                        error!(
                            stream_id = %self.stream_id,
                            stage = "reader",
                            error = %e,
                            attempts = consecutive_errors,
                            "giving up on log stream after repeated decode errors"
                        );
                        return ReaderExit::Failed;
                    }
                    warn!(
                        stream_id = %self.stream_id,
                        stage = "reader",
                        error = %e,
                        "frame decode failed, rebuilding decoder"
                    );
                    let stream = self.framed.into_inner();
                    self.framed = framed(stream, self.max_frame_size);
                    continue;
                }
                Some(Ok(payload)) => match LogEntry::decode(payload.freeze()) {
                    Ok(entry) => RawFrame::from(entry),
                    Err(e) => {
                        consecutive_errors += 1;
                        self.stats.add_decode_errors(1);
                        metrics::counter!(m::READER_DECODE_ERRORS_TOTAL).increment(1);
                        if consecutive_errors > self.max_decode_retries {
                            error!(
                                stream_id = %self.stream_id,
                                stage = "reader",
                                error = %e,
                                "giving up on log stream after repeated invalid entries"
                            );
                            return ReaderExit::Failed;
                        }
                        warn!(
                            stream_id = %self.stream_id,
                            stage = "reader",
                            error = %e,
                            "skipping invalid log entry"
                        );
                        continue;
                    }
                },
            };
            consecutive_errors = 0;

            self.stats.add_frames_read(1);
            metrics::counter!(m::READER_FRAMES_TOTAL).increment(1);

            if frame.is_blank() {
                self.stats.add_frames_skipped(1);
                metrics::counter!(m::READER_FRAMES_SKIPPED_TOTAL).increment(1);
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReaderExit::Cancelled,
                sent = tx.send(frame) => {
                    if sent.is_err() {
                        info!(stream_id = %self.stream_id, "annotator gone, stopping reader");
                        return ReaderExit::Cancelled;
                    }
                }
            }
        }
    }
}

fn framed<R: AsyncRead>(stream: R, max_frame_size: usize) -> FramedRead<R, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_size)
        .new_read(stream)
}

fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn entry(line: &str) -> LogEntry {
        LogEntry {
            source: "stdout".to_owned(),
            time_nano: 1_525_428_672_000_000_000,
            line: Bytes::copy_from_slice(line.as_bytes()),
            partial: false,
        }
    }

    fn reader<R: AsyncRead + Unpin>(stream: R, config: &PipelineConfig) -> FrameReader<R> {
        FrameReader::new(
            stream,
            config,
            Arc::from("test"),
            Arc::new(PipelineStats::default()),
        )
    }

    async fn collect(mut rx: mpsc::Receiver<RawFrame>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(frame) = rx.recv().await {
            lines.push(String::from_utf8_lossy(&frame.line).into_owned());
        }
        lines
    }

    #[tokio::test]
    async fn reads_frames_in_order_and_drops_blank_lines() {
        let (mut writer, stream) = tokio::io::duplex(4096);
        for line in ["first", "   ", "second", "\t\n", "third"] {
            writer.write_all(&encode_frame(&entry(line)).unwrap()).await.unwrap();
        }
        drop(writer);

        let (tx, rx) = mpsc::channel(16);
        let exit = reader(stream, &PipelineConfig::default())
            .run(tx, CancellationToken::new(), CancellationToken::new())
            .await;

        assert_eq!(exit, ReaderExit::Eof);
        assert_eq!(collect(rx).await, vec!["first", "second", "third"]);
    }

    #[test]
    fn unicode_whitespace_lines_are_blank() {
        for line in ["", " ", "\u{a0}", "\x0b", "\u{2003}\u{3000}", "\u{85}", "\r\n"] {
            let frame = RawFrame::from(entry(line));
            assert!(frame.is_blank(), "{line:?} should be blank");
        }
        for line in ["x", "\u{a0}x", "\u{3000}가"] {
            assert!(!RawFrame::from(entry(line)).is_blank(), "{line:?} is not blank");
        }
    }

    #[tokio::test]
    async fn drops_unicode_whitespace_only_frames() {
        let (mut writer, stream) = tokio::io::duplex(4096);
        for line in ["a", "\u{a0}", "\x0b", "b", "\u{2003}\u{3000}"] {
            writer.write_all(&encode_frame(&entry(line)).unwrap()).await.unwrap();
        }
        drop(writer);

        let (tx, rx) = mpsc::channel(16);
        let stats = Arc::new(PipelineStats::default());
        let exit = FrameReader::new(
            stream,
            &PipelineConfig::default(),
            Arc::from("test"),
            Arc::clone(&stats),
        )
        .run(tx, CancellationToken::new(), CancellationToken::new())
        .await;

        assert_eq!(exit, ReaderExit::Eof);
        assert_eq!(collect(rx).await, vec!["a", "b"]);
        assert_eq!(stats.snapshot().frames_skipped, 3);
    }

    #[test]
    fn encoded_frame_carries_length_prefix() {
        let e = entry("hello");
        let frame = encode_frame(&e).unwrap();
        let prefix = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(prefix as usize, e.encoded_len());
        assert_eq!(frame.len(), 4 + e.encoded_len());
    }

    #[tokio::test]
    async fn frame_fields_are_preserved() {
        let (mut writer, stream) = tokio::io::duplex(1024);
        let mut e = entry("oops");
        e.source = "stderr".to_owned();
        e.partial = true;
        writer.write_all(&encode_frame(&e).unwrap()).await.unwrap();
        drop(writer);

        let (tx, mut rx) = mpsc::channel(4);
        reader(stream, &PipelineConfig::default())
            .run(tx, CancellationToken::new(), CancellationToken::new())
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.source, "stderr");
        assert!(frame.partial);
        assert_eq!(frame.timestamp_nanos, 1_525_428_672_000_000_000);
    }

    #[tokio::test]
    async fn invalid_entry_is_skipped() {
        let (mut writer, stream) = tokio::io::duplex(1024);
        writer.write_all(&encode_frame(&entry("before")).unwrap()).await.unwrap();
        // 길이 5짜리 문자열 필드를 선언하고 1바이트만 보냄
        writer.write_all(&[0, 0, 0, 3, 0x0a, 0x05, b'a']).await.unwrap();
        writer.write_all(&encode_frame(&entry("after")).unwrap()).await.unwrap();
        drop(writer);

        let (tx, rx) = mpsc::channel(16);
        let exit = reader(stream, &PipelineConfig::default())
            .run(tx, CancellationToken::new(), CancellationToken::new())
            .await;

        assert_eq!(exit, ReaderExit::Eof);
        assert_eq!(collect(rx).await, vec!["before", "after"]);
    }

    #[tokio::test]
    async fn persistent_decode_error_terminates_reader() {
        let config = PipelineConfig {
            max_frame_size: 16,
            max_decode_retries: 0,
            ..PipelineConfig::default()
        };
        let (mut writer, stream) = tokio::io::duplex(1024);
        writer
            .write_all(&encode_frame(&entry(&"x".repeat(64))).unwrap())
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(4);
        let exit = reader(stream, &config)
            .run(tx, CancellationToken::new(), CancellationToken::new())
            .await;

        assert_eq!(exit, ReaderExit::Failed);
        assert!(collect(rx).await.is_empty());
        drop(writer);
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_pending_frames_then_stops() {
        let (mut writer, stream) = tokio::io::duplex(4096);
        writer.write_all(&encode_frame(&entry("a")).unwrap()).await.unwrap();
        writer.write_all(&encode_frame(&entry("b")).unwrap()).await.unwrap();

        let close = CancellationToken::new();
        close.cancel();

        let (tx, rx) = mpsc::channel(4);
        let exit = reader(stream, &PipelineConfig::default())
            .run(tx, close, CancellationToken::new())
            .await;

        assert_eq!(exit, ReaderExit::Stopped);
        assert_eq!(collect(rx).await, vec!["a", "b"]);
        drop(writer);
    }

    #[tokio::test]
    async fn cancel_stops_blocked_send() {
        let (mut writer, stream) = tokio::io::duplex(4096);
        writer.write_all(&encode_frame(&entry("a")).unwrap()).await.unwrap();
        writer.write_all(&encode_frame(&entry("b")).unwrap()).await.unwrap();

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        let task = tokio::spawn(
            reader(stream, &PipelineConfig::default()).run(tx, CancellationToken::new(), cancel.clone()),
        );
        tokio::task::yield_now().await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), ReaderExit::Cancelled);
        drop(writer);
    }

    #[test]
    fn peer_closed_kinds() {
        assert!(is_peer_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_peer_closed(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_peer_closed(&io::Error::from(io::ErrorKind::InvalidData)));
    }
}
