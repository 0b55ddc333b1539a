//! TimescaleDB 분석 저장소.
//!
//! `ohlcv` 하이퍼테이블에서 심볼/타임프레임별 캔들 범위를 조회합니다.
//! 연결은 `ConnectionPool`이 관리하므로 이 타입은 단일 `PgConnection`만 다룹니다.
//!
//! 테이블 스키마:
//!
//! ```sql
//! CREATE TABLE ohlcv (
//!     symbol     TEXT        NOT NULL,
//!     timeframe  TEXT        NOT NULL,
//!     open_time  TIMESTAMPTZ NOT NULL,
//!     open       NUMERIC     NOT NULL,
//!     high       NUMERIC     NOT NULL,
//!     low        NUMERIC     NOT NULL,
//!     close      NUMERIC     NOT NULL,
//!     volume     NUMERIC     NOT NULL,
//!     PRIMARY KEY (symbol, timeframe, open_time)
//! );
//! ```

use crate::error::{DataError, Result};
use crate::storage::{AnalyticalStore, ColumnValue, StoreRow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use crate::executor::BarColumns;
use quantfeed_core::{is_valid_column_name, is_valid_identifier, RangeKey, StoreConfig};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Row, TypeInfo};
use tracing::{debug, instrument};

/// TimescaleDB 백엔드.
#[derive(Debug, Clone)]
pub struct TimescaleStore {
    url: String,
    table: String,
    columns: BarColumns,
    select_sql: String,
}

impl TimescaleStore {
    /// 설정에서 저장소를 생성합니다. 테이블과 컬럼 이름은 식별자 검증을 거칩니다.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        if !is_valid_identifier(&config.table) {
            return Err(DataError::ConfigError(format!(
                "invalid table name: {}",
                config.table
            )));
        }

        Self {
            url: config.url.clone(),
            table: config.table.clone(),
            columns: BarColumns::default(),
            select_sql: String::new(),
        }
        .with_columns(config.columns.clone())
    }

    /// 조회할 바 컬럼 이름을 바꿉니다.
    pub fn with_columns(mut self, columns: BarColumns) -> Result<Self> {
        if let Some(bad) = columns.names().into_iter().find(|c| !is_valid_column_name(c)) {
            return Err(DataError::ConfigError(format!("invalid column name: {}", bad)));
        }
        self.select_sql = build_select(&self.table, &columns);
        self.columns = columns;
        Ok(self)
    }

    /// 조회하는 바 컬럼.
    pub fn columns(&self) -> &BarColumns {
        &self.columns
    }

    /// 범위 조회에 사용하는 SQL.
    pub fn select_sql(&self) -> &str {
        &self.select_sql
    }
}

fn build_select(table: &str, columns: &BarColumns) -> String {
    let ts = &columns.timestamp;
    format!(
        "SELECT {} FROM {} \
         WHERE symbol = $1 AND timeframe = $2 AND {ts} >= $3 AND {ts} < $4 \
         ORDER BY {ts} ASC",
        columns.names().join(", "),
        table,
        ts = ts
    )
}

#[async_trait]
impl AnalyticalStore for TimescaleStore {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect(&self.url)
            .await
            .map_err(|e| DataError::ConnectionError(e.to_string()))
    }

    #[instrument(skip(self, conn), fields(key = %key))]
    async fn query_range(&self, conn: &mut PgConnection, key: &RangeKey) -> Result<Vec<StoreRow>> {
        let rows = sqlx::query(&self.select_sql)
            .bind(&key.symbol)
            .bind(key.timeframe.as_str())
            .bind(key.start)
            .bind(key.end)
            .fetch_all(&mut *conn)
            .await?;

        debug!(rows = rows.len(), "Fetched rows from TimescaleDB");
        rows.iter().map(to_store_row).collect()
    }

    async fn server_version(&self, conn: &mut PgConnection) -> Result<String> {
        let (version,): (String,) = sqlx::query_as("SELECT version()")
            .fetch_one(&mut *conn)
            .await?;
        Ok(version)
    }
}

/// `PgRow`를 컬럼 타입에 따라 동적 행으로 변환합니다.
fn to_store_row(row: &PgRow) -> Result<StoreRow> {
    let mut out = StoreRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name();
        let value = match type_name {
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(ColumnValue::Timestamp),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(idx)?
                .map(|naive| ColumnValue::Timestamp(naive.and_utc())),
            "NUMERIC" => row
                .try_get::<Option<Decimal>, _>(idx)?
                .map(ColumnValue::Decimal),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(ColumnValue::Int),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)?
                .map(|v| ColumnValue::Int(v as i64)),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)?
                .map(|v| ColumnValue::Int(v as i64)),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(ColumnValue::Float),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)?
                .map(|v| ColumnValue::Float(v as f64)),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx)?.map(ColumnValue::Text)
            }
            other => {
                return Err(DataError::DataIntegrity(format!(
                    "unsupported column type {} for {}",
                    other,
                    column.name()
                )))
            }
        };
        out.push(column.name(), value.unwrap_or(ColumnValue::Null));
    }
    Ok(out)
}
