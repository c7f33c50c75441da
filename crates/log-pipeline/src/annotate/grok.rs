//! grok 패턴 테이블
//!
//! 매칭 문법은 `grok` 크레이트(Oniguruma 기반, logstash 기본 패턴 포함)에 맡기고,
//! 여기서는 사용자 정의 패턴을 모으는 일만 합니다.
//!
//! # 패턴 소스
//! - 기본 테이블 ([`PatternSet::with_defaults`])
//! - 인라인 정의: `NAME=regex`를 구분자로 연결한 문자열
//! - 파일/디렉토리: 줄마다 `NAME regex`, `#`으로 시작하는 줄은 주석

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use grok::{Grok, Pattern};

use crate::error::LogPipelineError;

/// 패턴 파일 최대 크기
const MAX_PATTERN_FILE_SIZE: u64 = 1024 * 1024;

/// 이름 있는 정규식 조각 테이블
pub struct PatternSet {
    grok: Grok,
    added: usize,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternSet {
    /// 빈 테이블을 만듭니다.
    pub fn new() -> Self {
        Self {
            grok: Grok::empty(),
            added: 0,
        }
    }

    /// 기본 패턴이 등록된 테이블을 만듭니다.
    pub fn with_defaults() -> Self {
        Self {
            grok: Grok::with_default_patterns(),
            added: 0,
        }
    }

    /// 사용자가 추가한 패턴 수
    pub fn added(&self) -> usize {
        self.added
    }

    /// 패턴을 추가합니다. 같은 이름은 덮어씁니다.
    pub fn add(&mut self, name: &str, regex: &str) -> Result<(), LogPipelineError> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(pattern_err(name, "pattern name must match [A-Za-z0-9_]+"));
        }
        if regex.is_empty() {
            return Err(pattern_err(name, "pattern definition is empty"));
        }
        self.grok.add_pattern(name, regex);
        self.added += 1;
        Ok(())
    }

    /// `NAME=regex` 정의를 `splitter`로 나누어 추가합니다.
    pub fn add_inline(&mut self, spec: &str, splitter: &str) -> Result<usize, LogPipelineError> {
        let mut added = 0;
        for def in spec.split(splitter).filter(|d| !d.trim().is_empty()) {
            let (name, regex) = def
                .split_once('=')
                .ok_or_else(|| pattern_err(def, "missing '=' separator"))?;
            self.add(name.trim(), regex)?;
            added += 1;
        }
        Ok(added)
    }

    /// `NAME regex` 줄 목록을 추가합니다.
    pub fn add_definitions(&mut self, text: &str, origin: &str) -> Result<usize, LogPipelineError> {
        let mut added = 0;
        for (lineno, line) in text.lines().enumerate() {
            match parse_line(line) {
                None => continue,
                Some(Ok((name, regex))) => {
                    self.add(name, regex)?;
                    added += 1;
                }
                Some(Err(reason)) => {
                    return Err(LogPipelineError::PatternLoad {
                        path: origin.to_owned(),
                        reason: format!("line {}: {reason}", lineno + 1),
                    });
                }
            }
        }
        Ok(added)
    }

    /// 파일 또는 디렉토리(하위 파일, 이름순)에서 패턴을 로드합니다.
    pub async fn load_path(&mut self, path: impl AsRef<Path>) -> Result<usize, LogPipelineError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| load_err(path, format!("failed to read metadata: {e}")))?;

        if !metadata.is_dir() {
            return self.load_file(path).await;
        }

        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| load_err(path, format!("failed to read directory: {e}")))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| load_err(path, format!("failed to read directory entry: {e}")))?
        {
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if is_file {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut added = 0;
        for file in files {
            added += self.load_file(&file).await?;
        }
        tracing::debug!(path = %path.display(), count = added, "loaded pattern directory");
        Ok(added)
    }

    async fn load_file(&mut self, path: &Path) -> Result<usize, LogPipelineError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| load_err(path, format!("failed to read metadata: {e}")))?;
        if metadata.len() > MAX_PATTERN_FILE_SIZE {
            return Err(load_err(
                path,
                format!("file too large: {} bytes (max {MAX_PATTERN_FILE_SIZE})", metadata.len()),
            ));
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| load_err(path, format!("failed to read file: {e}")))?;
        self.add_definitions(&text, &path.display().to_string())
    }

    /// 매칭 표현식을 컴파일합니다.
    ///
    /// `named_only`가 `false`면 필드 이름이 없는 참조도 패턴 이름으로 캡처합니다.
    ///
    /// # Errors
    /// 알 수 없는 패턴 이름, 너무 깊은 재귀, 정규식 문법 오류는
    /// [`LogPipelineError::Pattern`]입니다.
    pub fn compile(&mut self, expr: &str, named_only: bool) -> Result<GrokMatcher, LogPipelineError> {
        let pattern = self
            .grok
            .compile(expr, named_only)
            .map_err(|e| pattern_err(expr, e.to_string()))?;
        Ok(GrokMatcher {
            pattern,
            expr: expr.to_owned(),
        })
    }
}

/// 컴파일된 매칭 표현식
pub struct GrokMatcher {
    pattern: Pattern,
    expr: String,
}

impl fmt::Debug for GrokMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrokMatcher").field("expr", &self.expr).finish()
    }
}

impl GrokMatcher {
    /// 라인이 일치하면 캡처 맵을 반환합니다.
    pub fn captures(&self, line: &str) -> Option<BTreeMap<String, String>> {
        let matches = self.pattern.match_against(line)?;
        Some(
            matches
                .iter()
                .map(|(field, value)| (field.to_owned(), value.to_owned()))
                .collect(),
        )
    }

    /// 매칭 여부만 확인합니다.
    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.match_against(line).is_some()
    }

    /// 컴파일 전 표현식
    pub fn as_str(&self) -> &str {
        &self.expr
    }
}

/// `NAME regex` 한 줄을 해석합니다. 빈 줄과 주석은 `None`입니다.
fn parse_line(line: &str) -> Option<Result<(&str, &str), String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(match line.split_once(char::is_whitespace) {
        Some((name, regex)) if !regex.trim().is_empty() => Ok((name, regex.trim())),
        _ => Err(format!("expected 'NAME regex', got {line:?}")),
    })
}

fn pattern_err(name: &str, reason: impl Into<String>) -> LogPipelineError {
    LogPipelineError::Pattern {
        name: name.to_owned(),
        reason: reason.into(),
    }
}

fn load_err(path: &Path, reason: impl Into<String>) -> LogPipelineError {
    LogPipelineError::PatternLoad {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APACHE: &str = r#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /apache_pb.gif HTTP/1.0" 200 2326"#;

    #[test]
    fn named_fields_are_captured() {
        let mut set = PatternSet::with_defaults();
        let m = set.compile("%{WORD:verb} %{NUMBER:status}", true).unwrap();
        let caps = m.captures("GET 200").unwrap();
        assert_eq!(caps.get("verb").map(String::as_str), Some("GET"));
        assert_eq!(caps.get("status").map(String::as_str), Some("200"));
        assert_eq!(caps.len(), 2);
    }

    #[test]
    fn nested_patterns_expose_inner_fields() {
        let mut set = PatternSet::with_defaults();
        let m = set.compile("%{COMMONAPACHELOG}", true).unwrap();
        let caps = m.captures(APACHE).unwrap();
        assert_eq!(caps["clientip"], "127.0.0.1");
        assert_eq!(caps["auth"], "frank");
        assert_eq!(caps["verb"], "GET");
        assert_eq!(caps["request"], "/apache_pb.gif");
        assert_eq!(caps["response"], "200");
        assert_eq!(caps["bytes"], "2326");
    }

    #[test]
    fn lookaround_patterns_from_default_table() {
        // NUMBER, QUOTEDSTRING use lookbehind and atomic groups
        let mut set = PatternSet::with_defaults();
        let m = set
            .compile("%{NUMBER:took} %{QUOTEDSTRING:msg}", true)
            .unwrap();
        let caps = m.captures(r#"12.5 "done here""#).unwrap();
        assert_eq!(caps["took"], "12.5");
        assert_eq!(caps["msg"], r#""done here""#);
    }

    #[test]
    fn unnamed_references_captured_when_not_named_only() {
        let mut set = PatternSet::with_defaults();
        let m = set.compile("%{WORD} %{INT:n}", false).unwrap();
        let caps = m.captures("hello 42").unwrap();
        assert_eq!(caps["WORD"], "hello");
        assert_eq!(caps["n"], "42");

        let m = set.compile("%{WORD} %{INT:n}", true).unwrap();
        let caps = m.captures("hello 42").unwrap();
        assert!(!caps.contains_key("WORD"));
    }

    #[test]
    fn mismatch_returns_none() {
        let mut set = PatternSet::with_defaults();
        let m = set.compile("^%{INT:n}$", true).unwrap();
        assert!(m.captures("not a number").is_none());
        assert!(!m.is_match("abc"));
        assert!(m.is_match("7"));
    }

    #[test]
    fn unknown_pattern_fails_at_compile() {
        let mut set = PatternSet::with_defaults();
        let err = set.compile("%{NOPE:x}", true).unwrap_err();
        assert!(matches!(err, LogPipelineError::Pattern { .. }));
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn invalid_regex_fails_at_compile() {
        let mut set = PatternSet::new();
        set.add("BROKEN", "(unclosed").unwrap();
        assert!(set.compile("%{BROKEN:x}", true).is_err());
    }

    #[test]
    fn self_reference_fails_at_compile() {
        let mut set = PatternSet::new();
        set.add("LOOP", "a%{LOOP}").unwrap();
        assert!(set.compile("%{LOOP}", true).is_err());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut set = PatternSet::new();
        assert!(set.add("has space", "x").is_err());
        assert!(set.add("EMPTY", "").is_err());
        assert_eq!(set.added(), 0);
    }

    #[test]
    fn inline_definitions() {
        let mut set = PatternSet::with_defaults();
        let added = set
            .add_inline("MYAPP=app-[0-9]+ and MYLEVEL=%{LOGLEVEL}", " and ")
            .unwrap();
        assert_eq!(added, 2);
        let m = set.compile("%{MYAPP:app} %{MYLEVEL:level}", true).unwrap();
        let caps = m.captures("app-42 WARN").unwrap();
        assert_eq!(caps["app"], "app-42");
        assert_eq!(caps["level"], "WARN");

        let err = set.add_inline("MISSING_SEPARATOR", " and ").unwrap_err();
        assert!(err.to_string().contains("'='"));
    }

    #[test]
    fn definition_lines() {
        let mut set = PatternSet::new();
        let added = set
            .add_definitions("# comment\n\nFOO [a-z]+\nBAR %{FOO}-[0-9]+\n", "inline")
            .unwrap();
        assert_eq!(added, 2);
        let caps = set.compile("%{BAR:b}", true).unwrap().captures("ab-12").unwrap();
        assert_eq!(caps["b"], "ab-12");

        let err = set.add_definitions("ONLYNAME\n", "bad.txt").unwrap_err();
        assert!(err.to_string().contains("bad.txt"));
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn load_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.patterns"), "ALPHA [a-z]+\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("b.patterns"), "# beta\nBETA %{ALPHA}[0-9]\n")
            .await
            .unwrap();

        let mut set = PatternSet::new();
        assert_eq!(set.load_path(dir.path()).await.unwrap(), 2);
        let caps = set.compile("%{BETA:b}", true).unwrap().captures("xy7").unwrap();
        assert_eq!(caps["b"], "xy7");

        let mut single = PatternSet::new();
        assert_eq!(
            single.load_path(dir.path().join("a.patterns")).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn load_missing_path_fails() {
        let mut set = PatternSet::new();
        let err = set.load_path("/nonexistent/patterns").await.unwrap_err();
        assert!(matches!(err, LogPipelineError::PatternLoad { .. }));
    }
}
