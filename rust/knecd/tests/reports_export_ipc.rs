mod test_support;

use serde_json::json;
use test_support::{enter, grant_all, register_adult, request_ok, seed_kcse, spawn_sidecar, YEAR};

#[test]
fn released_cohort_reports_and_exports() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = seed_kcse(&mut stdin, &mut reader, "knecd-reports");
    grant_all(&mut stdin, &mut reader, "examiner-1");

    let a = register_adult(&mut stdin, &mut reader, "1", "Brian");
    let b = register_adult(&mut stdin, &mut reader, "2", "Kevin");
    enter(&mut stdin, &mut reader, "3", "examiner-1", &a, "MAT", 88);
    enter(&mut stdin, &mut reader, "4", "examiner-1", &a, "ENG", 81);
    enter(&mut stdin, &mut reader, "5", "examiner-1", &b, "MAT", 42);
    enter(&mut stdin, &mut reader, "6", "examiner-1", &b, "ENG", 55);

    // Before release the distribution already counts entered marks.
    let dist = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.gradeDistribution",
        json!({ "level": "KCSE", "year": YEAR, "subjectCode": "MAT" }),
    );
    assert_eq!(dist["total"], 2);
    let grades = dist["grades"].as_array().expect("grades");
    assert_eq!(grades[0]["grade"], "A");
    assert_eq!(grades[0]["count"], 1);

    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "rankings.recompute",
        json!({ "level": "KCSE", "year": YEAR }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.release",
        json!({ "level": "KCSE", "year": YEAR, "actor": "registrar" }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reports.schoolPerformance",
        json!({ "schoolCode": "NRB-01", "level": "KCSE", "year": YEAR, "actor": "analyst" }),
    )["report"]
        .clone();
    assert_eq!(report["totalCandidates"], 2);
    assert_eq!(report["candidatesWithResults"], 2);
    assert_eq!(report["topGrade"], "A");
    assert_eq!(report["rankNation"], 1);

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.exportResultsCsv",
        json!({ "level": "KCSE", "year": YEAR, "outPath": "exports/kcse.csv" }),
    );
    assert_eq!(exported["rows"], 2);
    let path = workspace.join("exports").join("kcse.csv");
    let mut rdr = csv::Reader::from_path(&path).expect("open export");
    let headers = rdr.headers().expect("headers").clone();
    assert_eq!(&headers[0], "index_number");
    let rows: Vec<csv::StringRecord> = rdr.records().collect::<Result<_, _>>().expect("rows");
    assert_eq!(&rows[0][0], a.as_str());
    assert_eq!(&rows[0][11], "1");

    let ranking_out = workspace.join("schools.csv");
    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "reports.exportSchoolRankingCsv",
        json!({ "level": "KCSE", "year": YEAR, "outPath": ranking_out.to_string_lossy() }),
    );
    assert_eq!(ranked["rows"], 1);
    assert!(ranking_out.exists());

    let stats = request_ok(&mut stdin, &mut reader, "13", "dashboard.stats", json!({}));
    assert_eq!(stats["activeYear"], YEAR);
    assert_eq!(stats["candidates"], 2);
    assert_eq!(stats["resultsEntered"], 4);
    assert_eq!(stats["aggregatesReleased"], 2);
}
