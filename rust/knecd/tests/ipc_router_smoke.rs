mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{request, request_err, request_ok, seed_kcse, spawn_sidecar, YEAR};

#[test]
fn router_answers_every_handler_family() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").is_some());
    assert_eq!(health["workspacePath"], serde_json::Value::Null);

    let code = request_err(&mut stdin, &mut reader, "2", "years.list", json!({}));
    assert_eq!(code, "no_workspace");

    let workspace = seed_kcse(&mut stdin, &mut reader, "knecd-router-smoke");
    let csv_out = workspace.join("smoke-results.csv");

    let calls = [
        ("config.get", json!({})),
        ("staff.list", json!({})),
        ("years.list", json!({})),
        ("levels.list", json!({})),
        ("subjects.list", json!({ "level": "KCSE" })),
        ("schools.list", json!({})),
        ("candidates.list", json!({})),
        ("candidates.validateIndex", json!({ "indexNumber": "NRB-01-2024-0001" })),
        ("schemes.list", json!({ "level": "KCSE" })),
        ("schemes.grade", json!({ "level": "KCSE", "year": YEAR, "score": 72 })),
        ("permissions.list", json!({})),
        ("results.list", json!({})),
        ("fraud.list", json!({})),
        ("activity.list", json!({ "limit": 5 })),
        ("reports.gradeDistribution", json!({ "level": "KCSE", "year": YEAR })),
        ("dashboard.stats", json!({})),
        (
            "reports.exportResultsCsv",
            json!({ "level": "KCSE", "year": YEAR, "outPath": csv_out.to_string_lossy() }),
        ),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("call-{i}");
        let resp = request(&mut stdin, &mut reader, &id, method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{method}: {resp}"
        );
    }

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "grade",
        "schemes.grade",
        json!({ "level": "KCSE", "year": YEAR, "score": 72 }),
    );
    assert_eq!(graded["grade"], "B");
    assert_eq!(graded["points"], 9);

    let code = request_err(&mut stdin, &mut reader, "unknown", "classes.list", json!({}));
    assert_eq!(code, "not_implemented");
}

#[test]
fn malformed_line_gets_bad_json_and_loop_continues() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "bad_json");

    let health = request_ok(&mut stdin, &mut reader, "after", "health", json!({}));
    assert!(health.get("version").is_some());
}
