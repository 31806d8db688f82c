#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const YEAR: &str = "2024/2025";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_knecd");
    let mut child = Command::new(exe)
        .env_remove("KNECD_CALLBACK_SECRET")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn knecd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

/// Returns the error code of a failed request.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

/// A workspace with an `admin` and a `registrar`, the active year, one senior
/// school, KCSE MAT/ENG and an A-D overall scheme.
pub fn seed_kcse(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) -> PathBuf {
    let workspace = temp_dir(prefix);
    request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "seed-admin",
        "staff.register",
        json!({ "actor": "admin", "fullName": "System Administrator", "role": "ADMIN" }),
    );
    request_ok(
        stdin,
        reader,
        "seed-registrar",
        "staff.register",
        json!({
            "actor": "registrar",
            "fullName": "Exams Registrar",
            "role": "KNEC_STAFF",
            "registeredBy": "admin"
        }),
    );
    request_ok(
        stdin,
        reader,
        "seed-year",
        "years.create",
        json!({ "label": YEAR, "startDate": "2024-01-08", "endDate": "2024-11-29", "active": true }),
    );
    request_ok(
        stdin,
        reader,
        "seed-school",
        "schools.create",
        json!({ "code": "NRB-01", "name": "Nairobi School", "category": "SENIOR", "county": "Nairobi" }),
    );
    for (code, name) in [("MAT", "Mathematics"), ("ENG", "English")] {
        request_ok(
            stdin,
            reader,
            &format!("seed-{code}"),
            "subjects.create",
            json!({ "code": code, "name": name, "level": "KCSE" }),
        );
    }
    request_ok(
        stdin,
        reader,
        "seed-scheme",
        "schemes.create",
        json!({
            "name": "KCSE overall",
            "level": "KCSE",
            "year": YEAR,
            "ranges": abcd_ranges(),
            "actor": "admin"
        }),
    );
    workspace
}

pub fn abcd_ranges() -> serde_json::Value {
    json!([
        { "grade": "A", "minScore": 80, "maxScore": 100, "points": 12 },
        { "grade": "B", "minScore": 60, "maxScore": 79, "points": 9 },
        { "grade": "C", "minScore": 40, "maxScore": 59, "points": 6 },
        { "grade": "D", "minScore": 0, "maxScore": 39, "points": 3 }
    ])
}

/// Registers an adult KCSE candidate at NRB-01 and returns the index number.
pub fn register_adult(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    first_name: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "candidates.register",
        json!({
            "schoolCode": "NRB-01",
            "level": "KCSE",
            "year": YEAR,
            "firstName": first_name,
            "lastName": "Kamau",
            "gender": "M",
            "dateOfBirth": "2000-05-01",
            "guardianPhone": "0712345678"
        }),
    );
    res["candidate"]["indexNumber"]
        .as_str()
        .expect("indexNumber")
        .to_string()
}

pub fn grant_all(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, examiner: &str) {
    request_ok(
        stdin,
        reader,
        &format!("grant-{examiner}"),
        "permissions.grant",
        json!({ "actor": examiner, "level": "KCSE", "year": YEAR, "grantedBy": "admin" }),
    );
}

pub fn enter(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    examiner: &str,
    index_number: &str,
    subject: &str,
    score: i64,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "results.enter",
        json!({
            "actor": examiner,
            "indexNumber": index_number,
            "subjectCode": subject,
            "rawScore": score
        }),
    )
}
