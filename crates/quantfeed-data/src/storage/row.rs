//! 저장소에서 반환되는 느슨한 타입의 행.
//!
//! 저장소 드라이버는 컬럼 타입을 동적으로 반환하므로, 실행기 경계에서
//! `BarDecoder`가 고정 스키마로 검증하기 전까지는 이 형태로 전달됩니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;

/// 동적 컬럼 값.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl ColumnValue {
    /// 오류 메시지용 타입 이름.
    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Int(_) => "int",
            ColumnValue::Float(_) => "float",
            ColumnValue::Decimal(_) => "decimal",
            ColumnValue::Text(_) => "text",
            ColumnValue::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Int(v) => write!(f, "{}", v),
            ColumnValue::Float(v) => write!(f, "{}", v),
            ColumnValue::Decimal(v) => write!(f, "{}", v),
            ColumnValue::Text(v) => write!(f, "'{}'", v),
            ColumnValue::Timestamp(v) => write!(f, "{}", v),
        }
    }
}

/// 컬럼 이름 → 값 목록으로 구성된 행.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreRow {
    columns: Vec<(String, ColumnValue)>,
}

impl StoreRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// 컬럼을 추가합니다 (빌더 형식).
    pub fn with(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: ColumnValue) {
        self.columns.push((name.into(), value));
    }

    /// 이름으로 컬럼 값을 조회합니다 (대소문자 무시).
    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(col, _)| col.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
