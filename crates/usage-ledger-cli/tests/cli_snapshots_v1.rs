#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn ul_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_ul") {
        Ok(value) => PathBuf::from(value),
        Err(_) => Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/ul"),
    }
}

fn ul_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(ul_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute ul command {:?}: {err}", args),
    }
}

fn parse_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

const FIXTURE_OBSERVATIONS: &str = r#"[
  {"entity_id": "host-1", "source": "db", "quantity": "reservable", "state": "active", "start": "2024-01-01T00:00:00Z"},
  {"entity_id": "host-2", "source": "db", "quantity": "reservable", "state": "active", "start": "2024-01-01T00:00:00Z"},
  {"entity_id": "host-1", "source": "db", "quantity": "committed", "state": "active", "start": "2024-01-02T00:00:00Z", "end": "2024-01-03T00:00:00Z"},
  {"entity_id": "host-9", "source": "mystery", "quantity": "active", "state": "active", "start": "2024-01-01T00:00:00Z"}
]"#;

#[test]
fn snapshot_usage_report_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("usage-snapshot-report-{}.sqlite3", Ulid::new()));
    let fixture_path =
        std::env::temp_dir().join(format!("usage-snapshot-obs-{}.json", Ulid::new()));
    if let Err(err) = std::fs::write(&fixture_path, FIXTURE_OBSERVATIONS) {
        panic!("failed to write fixture observations: {err}");
    }

    let ingest = ul_output(
        &db_path,
        &[
            "ingest",
            "--site",
            "site-a",
            "--input",
            &fixture_path.to_string_lossy(),
        ],
    );
    assert!(
        ingest.status.success(),
        "ingest failed: {}",
        String::from_utf8_lossy(&ingest.stderr)
    );

    let run = ul_output(
        &db_path,
        &[
            "run",
            "--site",
            "site-a",
            "--start",
            "2024-01-01T00:00:00Z",
            "--end",
            "2024-01-05T00:00:00Z",
        ],
    );
    assert!(
        run.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&run.stderr)
    );

    let mut payload = parse_json(&run);
    payload["run_id"] = Value::String("<run-id>".to_string());

    let snapshot = match serde_json::to_string_pretty(&payload) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize normalized report payload: {err}"),
    };

    let expected = r#"{
  "contract_version": "usage_report.v1",
  "run_id": "<run-id>",
  "site": "site-a",
  "window_start": "2024-01-01T00:00:00Z",
  "window_end": "2024-01-05T00:00:00Z",
  "bucket_minutes": 1440,
  "row_count": 12,
  "rejection_count": 1,
  "audits": [
    {
      "stage": "normalize",
      "input_rows": 4,
      "kept_rows": 3,
      "rejected_rows": 1,
      "input_hours": 312.0,
      "kept_hours": 216.0,
      "rejected_hours": 96.0
    },
    {
      "stage": "resolve",
      "input_rows": 4,
      "kept_rows": 4,
      "rejected_rows": 0,
      "input_hours": 0.0,
      "kept_hours": 0.0,
      "rejected_hours": 0.0
    },
    {
      "stage": "aggregate",
      "input_rows": 4,
      "kept_rows": 4,
      "rejected_rows": 0,
      "input_hours": 0.0,
      "kept_hours": 0.0,
      "rejected_hours": 0.0
    },
    {
      "stage": "resample",
      "input_rows": 3,
      "kept_rows": 3,
      "rejected_rows": 0,
      "input_hours": 0.0,
      "kept_hours": 0.0,
      "rejected_hours": 0.0
    },
    {
      "stage": "derive",
      "input_rows": 8,
      "kept_rows": 8,
      "rejected_rows": 0,
      "input_hours": 0.0,
      "kept_hours": 0.0,
      "rejected_hours": 0.0
    }
  ]
}"#;

    assert_eq!(snapshot, expected);

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&fixture_path);
}

#[test]
fn snapshot_engine_config_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("usage-snapshot-config-{}.sqlite3", Ulid::new()));

    let output = ul_output(&db_path, &["config", "show"]);
    assert!(output.status.success());

    let snapshot = match serde_json::to_string_pretty(&parse_json(&output)) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize config payload: {err}"),
    };

    let expected = r#"{
  "contract_version": "engine_config.v1",
  "config": {
    "site": "site-a",
    "priority_order": [
      "manual",
      "db",
      "legacy"
    ],
    "tombstone_policy": "authoritative",
    "window_start": "2024-01-01T00:00:00Z",
    "window_end": "2024-02-01T00:00:00Z",
    "bucket_minutes": 1440,
    "formulas": [
      {
        "name": "available",
        "op": "difference",
        "operands": [
          "reservable",
          "committed"
        ]
      },
      {
        "name": "idle",
        "op": "difference",
        "operands": [
          "committed",
          "occupied"
        ]
      }
    ]
  }
}"#;

    assert_eq!(snapshot, expected);

    let _ = std::fs::remove_file(&db_path);
}
