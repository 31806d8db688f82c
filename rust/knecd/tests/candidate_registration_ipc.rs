mod test_support;

use serde_json::json;
use test_support::{register_adult, request_err, request_ok, seed_kcse, spawn_sidecar, YEAR};

#[test]
fn index_numbers_are_sequential_per_school_and_year() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-index-seq");

    let first = register_adult(&mut stdin, &mut reader, "1", "Brian");
    let second = register_adult(&mut stdin, &mut reader, "2", "Kevin");
    assert_eq!(first, "NRB-01-2024-0001");
    assert_eq!(second, "NRB-01-2024-0002");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "candidates.list",
        json!({ "schoolCode": "NRB-01" }),
    );
    assert_eq!(listed["count"], 2);

    let check = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "candidates.validateIndex",
        json!({ "indexNumber": second }),
    );
    assert_eq!(check["valid"], true);
    assert_eq!(check["registered"], true);
    assert_eq!(check["parsed"]["sequence"], 2);

    let bad = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "candidates.validateIndex",
        json!({ "indexNumber": "NRB01-24-7" }),
    );
    assert_eq!(bad["valid"], false);
    assert!(bad["reason"].as_str().is_some());
}

#[test]
fn reused_birth_certificate_is_refused_and_logged() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-cert-guard");

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "certificates.register",
        json!({
            "certificateNumber": "123456789",
            "firstName": "Amina",
            "lastName": "Otieno",
            "dateOfBirth": "2008-03-14",
            "placeOfBirth": "Kisumu",
            "parentName": "Grace Otieno"
        }),
    );
    let minor = json!({
        "actor": "clerk-1",
        "schoolCode": "NRB-01",
        "level": "KCSE",
        "year": YEAR,
        "firstName": "Amina",
        "lastName": "Otieno",
        "gender": "F",
        "dateOfBirth": "2008-03-14",
        "certificateNumber": "123456789",
        "guardianPhone": "0712345678"
    });

    let mut no_cert = minor.clone();
    no_cert["certificateNumber"] = serde_json::Value::Null;
    let code = request_err(&mut stdin, &mut reader, "2", "candidates.register", no_cert);
    assert_eq!(code, "validation_failed");

    let ok = request_ok(&mut stdin, &mut reader, "3", "candidates.register", minor.clone());
    assert_eq!(ok["candidate"]["indexNumber"], "NRB-01-2024-0001");

    let code = request_err(&mut stdin, &mut reader, "4", "candidates.register", minor);
    assert_eq!(code, "fraud_rejected");

    let fraud = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fraud.list",
        json!({ "type": "DUPLICATE_BIRTH_CERT", "unresolvedOnly": true }),
    );
    assert_eq!(fraud["count"], 1);
    let attempt = &fraud["attempts"][0];
    assert_eq!(attempt["certificateNumber"], "123456789");
    assert_eq!(attempt["actor"], "clerk-1");

    // The refused registration did not consume a sequence number.
    let next = test_support::register_adult(&mut stdin, &mut reader, "6", "Brian");
    assert_eq!(next, "NRB-01-2024-0002");

    let id = attempt["id"].as_str().expect("fraud id").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fraud.resolve",
        json!({ "id": id, "actor": "auditor", "notes": "twin siblings checked" }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "fraud.resolve",
        json!({ "id": id, "actor": "auditor" }),
    );
    assert_eq!(code, "conflict");
}

#[test]
fn unknown_index_lookup_is_recorded_as_fake_index() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_kcse(&mut stdin, &mut reader, "knecd-fake-index");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "payments.entitlement",
        json!({ "indexNumber": "NRB-01-2024-0999", "ipAddress": "10.0.0.7" }),
    );
    assert_eq!(code, "fraud_rejected");

    let fraud = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fraud.list",
        json!({ "type": "FAKE_INDEX" }),
    );
    assert_eq!(fraud["count"], 1);
    assert_eq!(fraud["attempts"][0]["ipAddress"], "10.0.0.7");
}
