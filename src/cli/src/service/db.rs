use chrono::{DateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use sqlx::{
  migrate::Migrator,
  sqlite::{SqliteConnectOptions, SqliteJournalMode},
  FromRow, Pool, QueryBuilder, Sqlite,
};
use thiserror::Error;

use crate::*;

use super::modbus::{Reading, Value};

// NOTE: six binds per row keeps a chunk under the sqlite variable limit
const INSERT_CHUNK: usize = 128;

#[derive(Debug, Clone)]
pub(crate) struct Service {
  pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ReadingRow {
  pub(crate) id: i64,
  pub(crate) device: String,
  pub(crate) point: String,
  pub(crate) kind: String,
  pub(crate) timestamp: i64,
  pub(crate) raw: i64,
  pub(crate) value: f64,
}

/// Which readings to scan. Missing bounds are open, present ones inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
  pub device: Option<String>,
  pub point: Option<String>,
  pub from: Option<DateTime<Utc>>,
  pub to: Option<DateTime<Utc>>,
}

/// Position after the last row of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
  pub(crate) timestamp: i64,
  pub(crate) id: i64,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("Sqlx error")]
  Sqlx(#[from] sqlx::Error),

  #[error("Stored row {id} could not be decoded: {reason}")]
  Decode { id: i64, reason: String },

  #[error("Reading of {point:?} could not be encoded")]
  Encode { point: String },
}

#[derive(Debug, Error)]
pub enum MigrateError {
  #[error("Failed creating database directory")]
  Directory(#[from] std::io::Error),

  #[error("Migration failed")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

impl service::Service for Service {
  fn new(config: &config::Values) -> Self {
    let options = SqliteConnectOptions::new()
      .filename(&config.persistence.target)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(std::time::Duration::from_secs(5));

    let pool = sqlx::Pool::connect_lazy_with(options);

    Self { pool }
  }
}

impl Service {
  pub(crate) async fn migrate(
    &self,
    target: &str,
  ) -> Result<(), MigrateError> {
    if let Some(parent) = std::path::Path::new(target).parent() {
      if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent).await?;
      }
    }

    MIGRATOR.run(&self.pool).await?;

    tracing::info!("Migration ran successfully");

    Ok(())
  }

  #[tracing::instrument(skip_all, fields(count = readings.len()))]
  pub(crate) async fn insert_readings(
    &self,
    readings: &[Reading],
  ) -> Result<(), Error> {
    if readings.is_empty() {
      return Ok(());
    }

    let rows = readings
      .iter()
      .map(to_row)
      .collect::<Result<Vec<_>, Error>>()?;

    let mut transaction = self.pool.begin().await?;
    for chunk in rows.chunks(INSERT_CHUNK) {
      QueryBuilder::<Sqlite>::new(
        "insert into readings (device, point, kind, timestamp, raw, value) ",
      )
      .push_values(chunk, |mut binder, row| {
        binder
          .push_bind(row.device.clone())
          .push_bind(row.point.clone())
          .push_bind(row.kind.clone())
          .push_bind(row.timestamp)
          .push_bind(row.raw)
          .push_bind(row.value);
      })
      .build()
      .execute(&mut *transaction)
      .await?;
    }
    transaction.commit().await?;

    tracing::trace!("Inserted readings");

    Ok(())
  }

  /// One page of readings ordered by timestamp, then insertion.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn get_readings(
    &self,
    query: &Query,
    after: Option<Cursor>,
    limit: u32,
  ) -> Result<Vec<ReadingRow>, Error> {
    let from = query.from.map_or(i64::MIN, |from| from.timestamp_micros());
    let to = query.to.map_or(i64::MAX, |to| to.timestamp_micros());

    let mut builder = QueryBuilder::<Sqlite>::new(
      "select id, device, point, kind, timestamp, raw, value from readings ",
    );
    builder
      .push("where timestamp between ")
      .push_bind(from)
      .push(" and ")
      .push_bind(to);
    if let Some(device) = &query.device {
      builder.push(" and device = ").push_bind(device.clone());
    }
    if let Some(point) = &query.point {
      builder.push(" and point = ").push_bind(point.clone());
    }
    if let Some(after) = after {
      builder
        .push(" and (timestamp > ")
        .push_bind(after.timestamp)
        .push(" or (timestamp = ")
        .push_bind(after.timestamp)
        .push(" and id > ")
        .push_bind(after.id)
        .push("))");
    }
    builder
      .push(" order by timestamp asc, id asc limit ")
      .push_bind(limit as i64);

    let rows = builder
      .build_query_as::<ReadingRow>()
      .fetch_all(&self.pool)
      .await?;

    tracing::trace!("Fetched {} readings", rows.len());

    Ok(rows)
  }
}

impl ReadingRow {
  pub(crate) fn cursor(&self) -> Cursor {
    Cursor {
      timestamp: self.timestamp,
      id: self.id,
    }
  }
}

impl TryFrom<ReadingRow> for Reading {
  type Error = Error;

  fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
    let timestamp = DateTime::<Utc>::from_timestamp_micros(row.timestamp)
      .ok_or_else(|| Error::Decode {
        id: row.id,
        reason: format!("timestamp {} out of range", row.timestamp),
      })?;
    let raw = u32::try_from(row.raw).map_err(|_| Error::Decode {
      id: row.id,
      reason: format!("raw value {} out of range", row.raw),
    })?;
    let value = match row.kind.as_str() {
      "coil" => Value::Bool(raw != 0),
      _ => {
        // NOTE: shortest round-trip text keeps 50.0 as 50 instead of its
        // binary expansion
        let number = row.value.to_string().parse::<Decimal>().map_err(
          |error| Error::Decode {
            id: row.id,
            reason: error.to_string(),
          },
        )?;
        Value::Number(number.normalize())
      }
    };

    Ok(Reading {
      device: row.device,
      point: row.point,
      timestamp,
      raw,
      value,
    })
  }
}

fn to_row(reading: &Reading) -> Result<ReadingRow, Error> {
  let value = match reading.value {
    Value::Number(number) => number.to_f64().ok_or_else(|| Error::Encode {
      point: reading.point.clone(),
    })?,
    Value::Bool(bit) => {
      if bit {
        1.0
      } else {
        0.0
      }
    }
  };

  Ok(ReadingRow {
    id: 0,
    device: reading.device.clone(),
    point: reading.point.clone(),
    kind: reading.kind().to_owned(),
    timestamp: reading.timestamp.timestamp_micros(),
    raw: reading.raw as i64,
    value,
  })
}

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
