//! 저장소 행 → `Bar` 변환기.
//!
//! 드라이버가 반환한 동적 행을 고정 스키마로 검증합니다. 형식이 맞지 않는
//! 행은 모두 `DataError::DataIntegrity`이며, 행 번호와 컬럼 이름을 포함합니다.

use crate::error::{DataError, Result};
use crate::storage::{ColumnValue, StoreRow};
use chrono::{DateTime, Utc};
use quantfeed_core::{Bar, Price, RangeKey};
use rust_decimal::Decimal;
use std::str::FromStr;

/// 바 컬럼 이름 매핑 (`store.columns` 설정과 동일).
pub use quantfeed_core::BarColumnConfig as BarColumns;

/// 고정 스키마 바 디코더.
#[derive(Debug, Clone, Default)]
pub struct BarDecoder {
    columns: BarColumns,
}

impl BarDecoder {
    pub fn new(columns: BarColumns) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &BarColumns {
        &self.columns
    }

    /// 행 목록을 바로 변환합니다.
    ///
    /// 각 바는 OHLC 일관성, 기간 정렬, 요청 범위 포함 여부를 검증받고,
    /// 전체 목록은 타임스탬프가 엄격히 증가해야 합니다.
    pub fn decode(&self, key: &RangeKey, rows: &[StoreRow]) -> Result<Vec<Bar>> {
        let mut bars = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            bars.push(self.decode_row(key, idx, row)?);
        }
        ensure_strictly_increasing(&bars)?;
        Ok(bars)
    }

    fn decode_row(&self, key: &RangeKey, idx: usize, row: &StoreRow) -> Result<Bar> {
        let cols = &self.columns;
        let timestamp = to_timestamp(idx, &cols.timestamp, required(row, idx, &cols.timestamp)?)?;

        if !key.contains(timestamp) {
            return Err(DataError::DataIntegrity(format!(
                "row {}: {} {} outside requested range {}",
                idx, cols.timestamp, timestamp, key
            )));
        }

        let bar = Bar::new(
            key.symbol.clone(),
            key.timeframe,
            timestamp,
            self.price(row, idx, &cols.open)?,
            self.price(row, idx, &cols.high)?,
            self.price(row, idx, &cols.low)?,
            self.price(row, idx, &cols.close)?,
            self.price(row, idx, &cols.volume)?,
        );

        bar.validate()
            .map_err(|e| DataError::DataIntegrity(format!("row {}: {}", idx, e)))?;
        Ok(bar)
    }

    fn price(&self, row: &StoreRow, idx: usize, column: &str) -> Result<Price> {
        to_decimal(idx, column, required(row, idx, column)?)
    }
}

fn required<'a>(row: &'a StoreRow, idx: usize, column: &str) -> Result<&'a ColumnValue> {
    match row.get(column) {
        None => Err(DataError::DataIntegrity(format!(
            "row {}: missing column {}",
            idx, column
        ))),
        Some(ColumnValue::Null) => Err(DataError::DataIntegrity(format!(
            "row {}: column {} is null",
            idx, column
        ))),
        Some(value) => Ok(value),
    }
}

fn type_mismatch(idx: usize, column: &str, value: &ColumnValue) -> DataError {
    DataError::DataIntegrity(format!(
        "row {}: column {} has unexpected type {} ({})",
        idx,
        column,
        value.type_name(),
        value
    ))
}

fn to_timestamp(idx: usize, column: &str, value: &ColumnValue) -> Result<DateTime<Utc>> {
    match value {
        ColumnValue::Timestamp(ts) => Ok(*ts),
        ColumnValue::Int(secs) => {
            DateTime::from_timestamp(*secs, 0).ok_or_else(|| type_mismatch(idx, column, value))
        }
        ColumnValue::Text(text) => DateTime::parse_from_rfc3339(text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| type_mismatch(idx, column, value)),
        _ => Err(type_mismatch(idx, column, value)),
    }
}

fn to_decimal(idx: usize, column: &str, value: &ColumnValue) -> Result<Decimal> {
    match value {
        ColumnValue::Decimal(d) => Ok(*d),
        ColumnValue::Int(i) => Ok(Decimal::from(*i)),
        ColumnValue::Float(f) => {
            Decimal::try_from(*f).map_err(|_| type_mismatch(idx, column, value))
        }
        ColumnValue::Text(text) => {
            Decimal::from_str(text.trim()).map_err(|_| type_mismatch(idx, column, value))
        }
        _ => Err(type_mismatch(idx, column, value)),
    }
}

/// 타임스탬프가 엄격히 증가하는지 확인합니다 (중복/역순 거부).
pub fn ensure_strictly_increasing(bars: &[Bar]) -> Result<()> {
    for pair in bars.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.timestamp == prev.timestamp {
            return Err(DataError::DataIntegrity(format!(
                "duplicate bar at {} for {} {}",
                next.timestamp, next.symbol, next.timeframe
            )));
        }
        if next.timestamp < prev.timestamp {
            return Err(DataError::DataIntegrity(format!(
                "bars out of order: {} after {} for {} {}",
                next.timestamp, prev.timestamp, next.symbol, next.timeframe
            )));
        }
    }
    Ok(())
}
