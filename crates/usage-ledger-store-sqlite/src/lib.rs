#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;
use usage_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Observation, Quality, Quantity, RejectReason,
    RejectionRecord, RunReport, Stage, StageAudit, UsageRow,
};

const USAGE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_USAGE_V1: &str = r"
CREATE TABLE IF NOT EXISTS observations (
  observation_id TEXT PRIMARY KEY,
  site TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  source TEXT NOT NULL,
  quantity TEXT NOT NULL,
  state TEXT NOT NULL,
  start_at TEXT,
  end_at TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_observations_no_update
BEFORE UPDATE ON observations
BEGIN
  SELECT RAISE(FAIL, 'observations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_observations_no_delete
BEFORE DELETE ON observations
BEGIN
  SELECT RAISE(FAIL, 'observations is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_observations_site_entity
  ON observations(site, entity_id, quantity);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  site TEXT NOT NULL,
  window_start TEXT NOT NULL,
  window_end TEXT NOT NULL,
  bucket_minutes INTEGER NOT NULL CHECK (bucket_minutes >= 1),
  row_count INTEGER NOT NULL,
  rejection_count INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_rows (
  run_id TEXT NOT NULL,
  site TEXT NOT NULL,
  bucket TEXT NOT NULL,
  metric TEXT NOT NULL,
  value REAL,
  quality TEXT NOT NULL CHECK (quality IN ('ok', 'no_data', 'negative_flagged')),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_usage_rows_run_metric
  ON usage_rows(run_id, metric, bucket);

CREATE TABLE IF NOT EXISTS rejections (
  run_id TEXT NOT NULL,
  observation_id TEXT,
  entity_id TEXT NOT NULL,
  source TEXT NOT NULL,
  quantity TEXT,
  reason TEXT NOT NULL CHECK (
    reason IN (
      'missing_start',
      'missing_entity',
      'missing_state',
      'phantom_span',
      'unknown_source',
      'unknown_quantity',
      'bad_timestamp',
      'duplicate',
      'unmatched_exit'
    )
  ),
  detail TEXT NOT NULL,
  lost_hours REAL NOT NULL,
  window_start TEXT,
  window_end TEXT,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_rejections_run
  ON rejections(run_id, reason);

CREATE TABLE IF NOT EXISTS stage_audits (
  run_id TEXT NOT NULL,
  stage TEXT NOT NULL CHECK (
    stage IN ('normalize', 'resolve', 'aggregate', 'resample', 'derive')
  ),
  input_rows INTEGER NOT NULL,
  kept_rows INTEGER NOT NULL,
  rejected_rows INTEGER NOT NULL,
  input_hours REAL NOT NULL,
  kept_hours REAL NOT NULL,
  rejected_hours REAL NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);
";

pub struct SqliteUsageStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Ulid,
    pub site: String,
    pub window_start: String,
    pub window_end: String,
    pub bucket_minutes: i64,
    pub row_count: usize,
    pub rejection_count: usize,
    pub created_at: String,
}

impl SqliteUsageStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_USAGE_V1)
            .context("failed to apply usage schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![USAGE_MIGRATION_VERSION, now],
            )
            .context("failed to register usage schema migration")?;

        Ok(())
    }

    /// Appends observations for one site, assigning ULIDs where the caller
    /// left them blank. Returns the stored ids in input order.
    pub fn append_observations(
        &mut self,
        site: &str,
        observations: &[Observation],
    ) -> Result<Vec<Ulid>> {
        let recorded_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start observation transaction")?;

        let mut ids = Vec::with_capacity(observations.len());
        for observation in observations {
            let observation_id = match observation.observation_id {
                Some(value) => value,
                None => Ulid::new(),
            };
            tx.execute(
                "INSERT INTO observations(
                    observation_id, site, entity_id, source, quantity, state,
                    start_at, end_at, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    observation_id.to_string(),
                    site,
                    observation.entity_id,
                    observation.source,
                    observation.quantity,
                    observation.state,
                    observation.start,
                    observation.end,
                    recorded_at,
                ],
            )
            .context("failed to append observation")?;
            ids.push(observation_id);
        }

        tx.commit().context("failed to commit observations")?;
        tracing::debug!(site, appended = ids.len(), "observations stored");
        Ok(ids)
    }

    /// Loads every observation recorded for a site, oldest insert first.
    pub fn load_observations(&self, site: &str) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(
            "SELECT observation_id, entity_id, source, quantity, state, start_at, end_at
             FROM observations
             WHERE site = ?1
             ORDER BY rowid ASC",
        )?;

        let mut rows = stmt.query(params![site])?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_id: String = row.get(0)?;
            let observation_id = Ulid::from_string(&raw_id)
                .with_context(|| format!("invalid stored observation id: {raw_id}"))?;
            observations.push(Observation {
                observation_id: Some(observation_id),
                entity_id: row.get(1)?,
                source: row.get(2)?,
                quantity: row.get(3)?,
                state: row.get(4)?,
                start: row.get(5)?,
                end: row.get(6)?,
            });
        }

        Ok(observations)
    }

    /// Persists one run's full output table in a single transaction. Reports
    /// are regenerated per run and never merged, so an existing run id is an
    /// error rather than an upsert.
    pub fn save_report(&mut self, report: &RunReport) -> Result<()> {
        let created_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start report transaction")?;

        tx.execute(
            "INSERT INTO runs(
                run_id, site, window_start, window_end, bucket_minutes,
                row_count, rejection_count, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                report.run_id.to_string(),
                report.site,
                format_rfc3339(report.window_start).map_err(|err| anyhow!(err.to_string()))?,
                format_rfc3339(report.window_end).map_err(|err| anyhow!(err.to_string()))?,
                report.bucket_minutes,
                i64::try_from(report.rows.len()).unwrap_or(i64::MAX),
                i64::try_from(report.rejections.len()).unwrap_or(i64::MAX),
                created_at,
            ],
        )
        .context("failed to insert run")?;

        for row in &report.rows {
            tx.execute(
                "INSERT INTO usage_rows(run_id, site, bucket, metric, value, quality)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    report.run_id.to_string(),
                    row.site,
                    format_rfc3339(row.bucket).map_err(|err| anyhow!(err.to_string()))?,
                    row.metric,
                    row.value,
                    row.quality.as_str(),
                ],
            )
            .context("failed to insert usage row")?;
        }

        for rejection in &report.rejections {
            tx.execute(
                "INSERT INTO rejections(
                    run_id, observation_id, entity_id, source, quantity,
                    reason, detail, lost_hours, window_start, window_end
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    report.run_id.to_string(),
                    rejection.observation_id.map(|id| id.to_string()),
                    rejection.entity_id,
                    rejection.source,
                    rejection.quantity.map(Quantity::as_str),
                    rejection.reason.as_str(),
                    rejection.detail,
                    rejection.lost_hours,
                    rejection
                        .window_start
                        .map(format_rfc3339)
                        .transpose()
                        .map_err(|err| anyhow!(err.to_string()))?,
                    rejection
                        .window_end
                        .map(format_rfc3339)
                        .transpose()
                        .map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to insert rejection")?;
        }

        for audit in &report.audits {
            tx.execute(
                "INSERT INTO stage_audits(
                    run_id, stage, input_rows, kept_rows, rejected_rows,
                    input_hours, kept_hours, rejected_hours
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    report.run_id.to_string(),
                    audit.stage.as_str(),
                    i64::try_from(audit.input_rows).unwrap_or(i64::MAX),
                    i64::try_from(audit.kept_rows).unwrap_or(i64::MAX),
                    i64::try_from(audit.rejected_rows).unwrap_or(i64::MAX),
                    audit.input_hours,
                    audit.kept_hours,
                    audit.rejected_hours,
                ],
            )
            .context("failed to insert stage audit")?;
        }

        tx.commit().context("failed to commit report")?;
        tracing::debug!(run_id = %report.run_id, rows = report.rows.len(), "report stored");
        Ok(())
    }

    pub fn load_report(&self, run_id: Ulid) -> Result<Option<RunReport>> {
        let header = self
            .conn
            .query_row(
                "SELECT site, window_start, window_end, bucket_minutes
                 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to load run header")?;

        let Some((site, window_start, window_end, bucket_minutes)) = header else {
            return Ok(None);
        };

        Ok(Some(RunReport {
            run_id,
            site,
            window_start: parse_rfc3339_utc(&window_start)
                .map_err(|err| anyhow!(err.to_string()))?,
            window_end: parse_rfc3339_utc(&window_end).map_err(|err| anyhow!(err.to_string()))?,
            bucket_minutes,
            rows: self.load_usage_rows(run_id)?,
            rejections: self.load_rejections(run_id)?,
            audits: self.load_stage_audits(run_id)?,
        }))
    }

    pub fn load_usage_rows(&self, run_id: Ulid) -> Result<Vec<UsageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT site, bucket, metric, value, quality
             FROM usage_rows WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut usage_rows = Vec::new();
        while let Some(row) = rows.next()? {
            let bucket: String = row.get(1)?;
            let quality: String = row.get(4)?;
            usage_rows.push(UsageRow {
                site: row.get(0)?,
                bucket: parse_rfc3339_utc(&bucket).map_err(|err| anyhow!(err.to_string()))?,
                metric: row.get(2)?,
                value: row.get(3)?,
                quality: Quality::parse(&quality)
                    .ok_or_else(|| anyhow!("invalid stored quality flag: {quality}"))?,
            });
        }

        Ok(usage_rows)
    }

    pub fn load_rejections(&self, run_id: Ulid) -> Result<Vec<RejectionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT observation_id, entity_id, source, quantity, reason, detail,
                    lost_hours, window_start, window_end
             FROM rejections WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut rejections = Vec::new();
        while let Some(row) = rows.next()? {
            let observation_id: Option<String> = row.get(0)?;
            let quantity: Option<String> = row.get(3)?;
            let reason: String = row.get(4)?;
            let window_start: Option<String> = row.get(7)?;
            let window_end: Option<String> = row.get(8)?;
            rejections.push(RejectionRecord {
                observation_id: observation_id
                    .map(|raw| {
                        Ulid::from_string(&raw)
                            .with_context(|| format!("invalid stored observation id: {raw}"))
                    })
                    .transpose()?,
                entity_id: row.get(1)?,
                source: row.get(2)?,
                quantity: quantity.as_deref().and_then(Quantity::parse),
                reason: RejectReason::parse(&reason)
                    .ok_or_else(|| anyhow!("invalid stored rejection reason: {reason}"))?,
                detail: row.get(5)?,
                lost_hours: row.get(6)?,
                window_start: window_start
                    .map(|raw| parse_rfc3339_utc(&raw).map_err(|err| anyhow!(err.to_string())))
                    .transpose()?,
                window_end: window_end
                    .map(|raw| parse_rfc3339_utc(&raw).map_err(|err| anyhow!(err.to_string())))
                    .transpose()?,
            });
        }

        Ok(rejections)
    }

    pub fn load_stage_audits(&self, run_id: Ulid) -> Result<Vec<StageAudit>> {
        let mut stmt = self.conn.prepare(
            "SELECT stage, input_rows, kept_rows, rejected_rows,
                    input_hours, kept_hours, rejected_hours
             FROM stage_audits WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut audits = Vec::new();
        while let Some(row) = rows.next()? {
            let stage: String = row.get(0)?;
            audits.push(StageAudit {
                stage: Stage::parse(&stage)
                    .ok_or_else(|| anyhow!("invalid stored stage name: {stage}"))?,
                input_rows: usize_from_row(row.get(1)?)?,
                kept_rows: usize_from_row(row.get(2)?)?,
                rejected_rows: usize_from_row(row.get(3)?)?,
                input_hours: row.get(4)?,
                kept_hours: row.get(5)?,
                rejected_hours: row.get(6)?,
            });
        }

        Ok(audits)
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, site, window_start, window_end, bucket_minutes,
                    row_count, rejection_count, created_at
             FROM runs ORDER BY created_at ASC, run_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_id: String = row.get(0)?;
            summaries.push(RunSummary {
                run_id: Ulid::from_string(&raw_id)
                    .with_context(|| format!("invalid stored run id: {raw_id}"))?,
                site: row.get(1)?,
                window_start: row.get(2)?,
                window_end: row.get(3)?,
                bucket_minutes: row.get(4)?,
                row_count: usize_from_row(row.get(5)?)?,
                rejection_count: usize_from_row(row.get(6)?)?,
                created_at: row.get(7)?,
            });
        }

        Ok(summaries)
    }
}

fn usize_from_row(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("negative count stored: {value}"))
}
