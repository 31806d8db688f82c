mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    enter, grant_all, register_adult, request_err, request_ok, seed_kcse, spawn_sidecar, YEAR,
};

fn agg(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    index: &str,
) -> serde_json::Value {
    request_ok(stdin, reader, id, "aggregates.get", json!({ "indexNumber": index }))["aggregate"]
        .clone()
}

#[test]
fn positions_follow_points_and_freeze_on_release() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-rank-release");
    request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "schools.create",
        json!({ "code": "MSA-01", "name": "Mombasa High", "category": "MIXED", "county": "Mombasa" }),
    );
    grant_all(&mut stdin, &mut reader, "examiner-1");

    let top = register_adult(&mut stdin, &mut reader, "1", "Brian");
    let low = register_adult(&mut stdin, &mut reader, "2", "Kevin");
    let coast = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "candidates.register",
        json!({
            "schoolCode": "MSA-01",
            "level": "KCSE",
            "year": YEAR,
            "firstName": "Halima",
            "lastName": "Said",
            "gender": "F",
            "dateOfBirth": "2001-02-11",
            "guardianPhone": "0722000111"
        }),
    )["candidate"]["indexNumber"]
        .as_str()
        .expect("indexNumber")
        .to_string();

    for (i, (index, mat, eng)) in [(&top, 90, 85), (&low, 35, 20), (&coast, 65, 70)]
        .into_iter()
        .enumerate()
    {
        enter(&mut stdin, &mut reader, &format!("m{i}"), "examiner-1", index, "MAT", mat);
        enter(&mut stdin, &mut reader, &format!("e{i}"), "examiner-1", index, "ENG", eng);
    }

    // Fresh marks leave positions stale, so release is refused.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "results.release",
        json!({ "level": "KCSE", "year": YEAR, "actor": "registrar" }),
    );
    assert_eq!(code, "conflict");

    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "rankings.recompute",
        json!({ "level": "KCSE", "year": YEAR, "actor": "registrar" }),
    );
    assert_eq!(ranked["ranked"], 3);

    let a = agg(&mut stdin, &mut reader, "6", &top);
    assert_eq!(a["positionNation"], 1);
    assert_eq!(a["positionSchool"], 1);
    let b = agg(&mut stdin, &mut reader, "7", &coast);
    assert_eq!(b["positionNation"], 2);
    assert_eq!(b["positionCounty"], 1);
    let c = agg(&mut stdin, &mut reader, "8", &low);
    assert_eq!(c["positionNation"], 3);
    assert_eq!(c["positionSchool"], 2);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "results.release",
        json!({ "level": "KCSE", "year": YEAR }),
    );
    assert_eq!(code, "bad_params");

    let released = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "results.release",
        json!({ "level": "KCSE", "year": YEAR, "actor": "registrar" }),
    );
    assert_eq!(released["released"], 3);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "rankings.recompute",
        json!({ "level": "KCSE", "year": YEAR }),
    );
    assert_eq!(code, "conflict");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "results.enter",
        json!({ "actor": "examiner-1", "indexNumber": top, "subjectCode": "MAT", "rawScore": 10 }),
    );
    assert_eq!(code, "conflict");

    // A candidate with no marks at release time cannot join the cohort later.
    let late = register_adult(&mut stdin, &mut reader, "12a", "Otieno");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "12b",
        "results.enter",
        json!({ "actor": "examiner-1", "indexNumber": late, "subjectCode": "MAT", "rawScore": 60 }),
    );
    assert_eq!(code, "conflict");
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "12c",
        "aggregates.get",
        json!({ "indexNumber": late }),
    );
    assert_eq!(view["aggregate"], serde_json::Value::Null);

    let activity = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "activity.list",
        json!({ "action": "RESULT_RELEASE" }),
    );
    assert_eq!(activity["count"], 1);
    assert_eq!(activity["entries"][0]["actor"], "registrar");
}
