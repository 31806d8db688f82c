mod test_support;

use serde_json::json;
use test_support::{enter, grant_all, register_adult, request_err, request_ok, seed_kcse, spawn_sidecar};

#[test]
fn entry_without_permission_is_forbidden_and_logged() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-marks-tamper");
    let index = register_adult(&mut stdin, &mut reader, "1", "Brian");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "results.enter",
        json!({ "actor": "intruder", "indexNumber": index, "subjectCode": "MAT", "rawScore": 99 }),
    );
    assert_eq!(code, "forbidden");

    let fraud = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fraud.list",
        json!({ "type": "MARKS_TAMPERING" }),
    );
    assert_eq!(fraud["count"], 1);
    assert_eq!(fraud["attempts"][0]["actor"], "intruder");

    let rows = request_ok(&mut stdin, &mut reader, "4", "results.list", json!({}));
    assert_eq!(rows["count"], 0);
}

#[test]
fn entered_marks_are_graded_and_aggregated() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-marks-grade");
    let index = register_adult(&mut stdin, &mut reader, "1", "Brian");
    grant_all(&mut stdin, &mut reader, "examiner-1");

    let mat = enter(&mut stdin, &mut reader, "2", "examiner-1", &index, "MAT", 85);
    assert_eq!(mat["result"]["grade"], "A");
    assert_eq!(mat["result"]["points"], 12);

    let eng = enter(&mut stdin, &mut reader, "3", "examiner-1", &index, "ENG", 45);
    assert_eq!(eng["result"]["grade"], "C");
    let agg = &eng["result"]["aggregate"];
    assert_eq!(agg["totalPoints"], 18);
    assert_eq!(agg["meanPoints"], 9);
    assert_eq!(agg["meanGrade"], "B");

    // Re-entry replaces the mark and reports what it replaced.
    let again = enter(&mut stdin, &mut reader, "4", "examiner-1", &index, "ENG", 30);
    assert_eq!(again["result"]["previousScore"], 45);
    assert_eq!(again["result"]["grade"], "D");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "results.enter",
        json!({ "actor": "examiner-1", "indexNumber": index, "subjectCode": "MAT", "rawScore": 101 }),
    );
    assert_eq!(code, "validation_failed");

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "aggregates.get",
        json!({ "indexNumber": index }),
    );
    assert_eq!(view["subjects"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(view["aggregate"]["totalPoints"], 15);
}

#[test]
fn bulk_entry_reports_rows_independently() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-marks-bulk");
    let index = register_adult(&mut stdin, &mut reader, "1", "Brian");
    grant_all(&mut stdin, &mut reader, "examiner-1");

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.enterBulk",
        json!({
            "actor": "examiner-1",
            "entries": [
                { "indexNumber": index, "subjectCode": "MAT", "rawScore": 70 },
                { "indexNumber": index, "subjectCode": "ENG", "rawScore": "seventy" },
                { "subjectCode": "ENG", "rawScore": 50 },
                { "indexNumber": index, "subjectCode": "ENG", "rawScore": 62 }
            ]
        }),
    );
    assert_eq!(out["updated"], 2);
    assert_eq!(out["rejected"], 2);
    let errors = out["errors"].as_array().expect("errors");
    assert_eq!(errors[0]["row"], 1);
    assert_eq!(errors[0]["code"], "validation_failed");
    assert_eq!(errors[1]["row"], 2);
    assert_eq!(errors[1]["code"], "bad_params");

    let too_many: Vec<serde_json::Value> = (0..5001)
        .map(|_| json!({ "indexNumber": index, "subjectCode": "MAT", "rawScore": 1 }))
        .collect();
    let out = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.enterBulk",
        json!({ "actor": "examiner-1", "entries": too_many }),
    );
    assert_eq!(out["limitExceeded"], true);
    assert_eq!(out["updated"], 0);
}

#[test]
fn closed_entry_window_refuses_marks() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-marks-window");
    let index = register_adult(&mut stdin, &mut reader, "1", "Brian");
    grant_all(&mut stdin, &mut reader, "examiner-1");

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "config.update",
        json!({ "section": "marksEntry", "patch": { "deadline": "2020-01-01T00:00:00Z" } }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "results.enter",
        json!({ "actor": "examiner-1", "indexNumber": index, "subjectCode": "MAT", "rawScore": 50 }),
    );
    assert_eq!(code, "forbidden");

    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "permissions.revoke",
        json!({ "actor": "examiner-1", "level": "KCSE", "year": test_support::YEAR }),
    );
    let perms = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "permissions.list",
        json!({ "actor": "examiner-1" }),
    );
    assert_eq!(perms["permissions"][0]["isActive"], false);
}
