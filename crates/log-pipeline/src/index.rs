//! 인덱스 이름 결정 — 날짜 토큰 템플릿을 실제 인덱스 이름으로 변환
//!
//! 지원 토큰:
//!
//! | 토큰 | 의미 | 예 (2018-05-04) |
//! |------|------|-----------------|
//! | `%F` | `%Y.%m.%d` | `2018.05.04` |
//! | `%Y` | 4자리 연도 | `2018` |
//! | `%m` | 2자리 월 | `05` |
//! | `%d` | 2자리 일 | `04` |
//! | `%b` | 월 약칭 | `may` |
//! | `%B` | 월 전체 이름 | `may` |
//! | `%y` | 2자리 연도 | `18` |
//! | `%j` | 연중 일수 (패딩 없음) | `124` |
//!
//! 결과는 항상 소문자이며 UTC 기준으로 계산합니다.

use std::sync::RwLock;

use chrono::{DateTime, Datelike, NaiveDate, Utc};

const TOKENS: &[char] = &['F', 'Y', 'm', 'd', 'b', 'B', 'y', 'j'];

/// 템플릿에 알 수 없는 `%` 토큰이 없는지 검증합니다.
pub fn validate_template(template: &str) -> Result<(), String> {
    if template.is_empty() {
        return Err("must not be empty".to_owned());
    }
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.next() {
            Some(t) if TOKENS.contains(&t) => {}
            Some(t) => return Err(format!("unsupported token %{t}")),
            None => return Err("dangling '%' at end of template".to_owned()),
        }
    }
    Ok(())
}

/// 템플릿에 날짜 토큰이 있는지 확인합니다.
pub fn has_rotation(template: &str) -> bool {
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c == '%' && chars.next().is_some_and(|t| TOKENS.contains(&t)) {
            return true;
        }
    }
    false
}

/// `now` 시점의 인덱스 이름을 계산합니다.
///
/// 알 수 없는 토큰은 그대로 남깁니다 (검증은 [`validate_template`]의 몫).
pub fn resolve(now: DateTime<Utc>, template: &str) -> String {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('F') => out.push_str(&now.format("%Y.%m.%d").to_string()),
            Some('Y') => out.push_str(&now.year().to_string()),
            Some('m') => out.push_str(&format!("{:02}", now.month())),
            Some('d') => out.push_str(&format!("{:02}", now.day())),
            Some('b') => out.push_str(&now.format("%b").to_string()),
            Some('B') => out.push_str(&now.format("%B").to_string()),
            Some('y') => out.push_str(&format!("{:02}", now.year().rem_euclid(100))),
            Some('j') => out.push_str(&now.ordinal().to_string()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out.to_lowercase()
}

/// 날짜가 바뀔 때 다시 계산되는 인덱스 이름 캐시
///
/// 여러 커밋 워커가 읽고, 날짜가 바뀐 뒤 처음 읽는 쪽이 갱신합니다.
#[derive(Debug)]
pub struct IndexNameCell {
    template: String,
    rotates: bool,
    state: RwLock<Resolved>,
}

#[derive(Debug, Clone)]
struct Resolved {
    date: NaiveDate,
    name: String,
}

impl IndexNameCell {
    /// `now` 기준으로 초기 이름을 계산하여 셀을 만듭니다.
    pub fn new(template: impl Into<String>, now: DateTime<Utc>) -> Self {
        let template = template.into();
        let rotates = has_rotation(&template);
        let state = Resolved {
            date: now.date_naive(),
            name: resolve(now, &template),
        };
        Self {
            template,
            rotates,
            state: RwLock::new(state),
        }
    }

    /// 현재 시각 기준 인덱스 이름
    pub fn current(&self) -> String {
        self.at(Utc::now())
    }

    /// `now` 기준 인덱스 이름. 날짜가 바뀌었으면 다시 계산합니다.
    pub fn at(&self, now: DateTime<Utc>) -> String {
        let today = now.date_naive();
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !self.rotates || state.date == today {
                return state.name.clone();
            }
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.date != today {
            let name = resolve(now, &self.template);
            tracing::debug!(index = %name, "index name rotated");
            *state = Resolved { date: today, name };
        }
        state.name.clone()
    }

    /// 원본 템플릿
    pub fn template(&self) -> &str {
        &self.template
    }
}
