use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};

use crate::scores::DocumentReport;
use crate::services::DocumentHandle;
use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "0.1.0";

pub fn open_database(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS documents (
          doc_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          byte_len INTEGER NOT NULL,
          stored_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reports (
          report_id INTEGER PRIMARY KEY AUTOINCREMENT,
          doc_id TEXT NOT NULL,
          run_id TEXT NOT NULL,
          created_at TEXT NOT NULL,
          ok INTEGER NOT NULL,
          error TEXT,
          extraction_path TEXT NOT NULL,
          layout_variant TEXT,
          layout_basis TEXT,
          record_count INTEGER NOT NULL,
          report_json TEXT NOT NULL,
          FOREIGN KEY(doc_id) REFERENCES documents(doc_id)
        );

        CREATE TABLE IF NOT EXISTS test_records (
          report_id INTEGER NOT NULL,
          seq INTEGER NOT NULL,
          category TEXT NOT NULL,
          label TEXT,
          round INTEGER,
          occurred_on TEXT,
          date_precision TEXT,
          four_subject_score REAL,
          four_subject_grade INTEGER,
          four_subject_deviation REAL,
          two_subject_score REAL,
          two_subject_grade INTEGER,
          two_subject_deviation REAL,
          annotation_count INTEGER NOT NULL,
          record_json TEXT NOT NULL,
          PRIMARY KEY(report_id, seq),
          FOREIGN KEY(report_id) REFERENCES reports(report_id)
        );

        CREATE TABLE IF NOT EXISTS trends (
          report_id INTEGER NOT NULL,
          category TEXT NOT NULL,
          metric TEXT NOT NULL,
          verdict TEXT NOT NULL,
          first_value REAL,
          last_value REAL,
          delta REAL,
          value_count INTEGER NOT NULL,
          PRIMARY KEY(report_id, category),
          FOREIGN KEY(report_id) REFERENCES reports(report_id)
        );

        CREATE INDEX IF NOT EXISTS idx_reports_doc ON reports(doc_id, report_id);
        ",
        )
        .context("failed to create sqlite schema")?;

    connection
        .execute(
            "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![DB_SCHEMA_VERSION],
        )
        .context("failed to record db_schema_version")?;

    Ok(())
}

pub fn upsert_document(
    connection: &Connection,
    handle: &DocumentHandle,
    name: &str,
    byte_len: usize,
) -> Result<()> {
    connection
        .execute(
            "INSERT INTO documents(doc_id, name, byte_len, stored_at) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(doc_id) DO UPDATE SET name = excluded.name",
            params![handle.as_str(), name, byte_len as i64, now_utc_string()],
        )
        .with_context(|| format!("failed to upsert document {handle}"))?;
    Ok(())
}

/// Writes one report with its records and trends in a single transaction.
pub fn persist_report(
    connection: &mut Connection,
    run_id: &str,
    report: &DocumentReport,
) -> Result<i64> {
    let Some(handle) = &report.document else {
        bail!("cannot persist a report without a source document");
    };

    let report_json =
        serde_json::to_string(report).context("failed to serialize report for sqlite")?;
    let layout = report.diagnostics.layout.as_ref();

    let tx = connection
        .transaction()
        .context("failed to start report transaction")?;

    tx.execute(
        "INSERT INTO reports(doc_id, run_id, created_at, ok, error, extraction_path,
                             layout_variant, layout_basis, record_count, report_json)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            handle.as_str(),
            run_id,
            now_utc_string(),
            report.ok,
            report.error,
            report.extraction_path.as_str(),
            layout.map(|selection| selection.chosen.as_str()),
            layout.map(|selection| selection.basis.as_str()),
            report.records.len() as i64,
            report_json,
        ],
    )
    .with_context(|| format!("failed to insert report for {handle}"))?;
    let report_id = tx.last_insert_rowid();

    {
        let mut statement = tx
            .prepare(
                "INSERT INTO test_records(report_id, seq, category, label, round, occurred_on,
                   date_precision, four_subject_score, four_subject_grade, four_subject_deviation,
                   two_subject_score, two_subject_grade, two_subject_deviation, annotation_count,
                   record_json)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )
            .context("failed to prepare test_records insert")?;

        for (seq, record) in report.records.iter().enumerate() {
            let four = &record.combined_totals.four_subject;
            let two = &record.combined_totals.two_subject;
            let record_json =
                serde_json::to_string(record).context("failed to serialize test record")?;
            statement
                .execute(params![
                    report_id,
                    seq as i64,
                    record.category.as_str(),
                    record.label,
                    record.round,
                    record.occurred_on.map(|date| date.to_string()),
                    record.date_precision.map(|precision| precision.as_str()),
                    four.raw_score,
                    four.grade_level,
                    four.percentile_deviation,
                    two.raw_score,
                    two.grade_level,
                    two.percentile_deviation,
                    record.annotations.len() as i64,
                    record_json,
                ])
                .with_context(|| format!("failed to insert test record {seq} for {handle}"))?;
        }

        let mut statement = tx
            .prepare(
                "INSERT INTO trends(report_id, category, metric, verdict, first_value, last_value,
                                    delta, value_count)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .context("failed to prepare trends insert")?;

        for trend in &report.trends {
            statement
                .execute(params![
                    report_id,
                    trend.category.as_str(),
                    trend.metric.as_str(),
                    trend.verdict.as_str(),
                    trend.first,
                    trend.last,
                    trend.delta,
                    trend.values.len() as i64,
                ])
                .with_context(|| format!("failed to insert trend for {handle}"))?;
        }
    }

    tx.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![now_utc_string()],
    )
    .context("failed to update db_updated_at")?;

    tx.commit().context("failed to commit report transaction")?;
    Ok(report_id)
}

pub fn load_latest_report(
    connection: &Connection,
    handle: &DocumentHandle,
) -> Result<Option<DocumentReport>> {
    let raw: Option<String> = connection
        .query_row(
            "SELECT report_json FROM reports WHERE doc_id = ?1 ORDER BY report_id DESC LIMIT 1",
            params![handle.as_str()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to query latest report for {handle}"))?;

    raw.map(|raw| {
        serde_json::from_str::<DocumentReport>(&raw)
            .with_context(|| format!("failed to parse stored report for {handle}"))
    })
    .transpose()
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to count rows: {sql}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scores::{LayoutHint, ReportPipeline};

    const TRANSCRIPT: &str = "育成テスト\n第1回 2024/04/14 300 6 190 6\n第2回 2024/05/12 320 7 205 7\n";

    fn stored_report(handle: &DocumentHandle) -> DocumentReport {
        let pipeline = ReportPipeline::new().expect("pipeline");
        let mut report = pipeline.process_text(TRANSCRIPT, LayoutHint::Auto);
        report.document = Some(handle.clone());
        report
    }

    #[test]
    fn persisted_report_round_trips_and_counts() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut connection = open_database(&scratch.path().join("gradescan.sqlite")).expect("db");
        let handle = DocumentHandle::new("c".repeat(64));
        upsert_document(&connection, &handle, "report.pdf", 1024).expect("document");

        let report = stored_report(&handle);
        persist_report(&mut connection, "run-1", &report).expect("first persist");
        persist_report(&mut connection, "run-2", &report).expect("second persist");

        assert_eq!(count_rows(&connection, "SELECT COUNT(*) FROM reports").expect("count"), 2);
        assert_eq!(
            count_rows(&connection, "SELECT COUNT(*) FROM test_records").expect("count"),
            4
        );
        assert_eq!(count_rows(&connection, "SELECT COUNT(*) FROM trends").expect("count"), 2);

        let loaded = load_latest_report(&connection, &handle)
            .expect("load")
            .expect("stored report");
        assert_eq!(loaded, report);
    }

    #[test]
    fn missing_documents_have_no_report() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let connection = open_database(&scratch.path().join("gradescan.sqlite")).expect("db");
        let handle = DocumentHandle::new("d".repeat(64));
        assert!(load_latest_report(&connection, &handle).expect("query").is_none());
    }

    #[test]
    fn transcript_only_reports_are_not_persisted() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut connection = open_database(&scratch.path().join("gradescan.sqlite")).expect("db");
        let pipeline = ReportPipeline::new().expect("pipeline");
        let report = pipeline.process_text(TRANSCRIPT, LayoutHint::Auto);
        assert!(persist_report(&mut connection, "run-1", &report).is_err());
    }
}
