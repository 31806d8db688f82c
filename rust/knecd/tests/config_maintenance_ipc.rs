mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn config_sections_validate_and_hide_the_secret() {
    let workspace = temp_dir("knecd-config");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let cfg = request_ok(&mut stdin, &mut reader, "2", "config.get", json!({}));
    assert_eq!(cfg["results"]["resultAccessFee"], 50.0);
    assert_eq!(cfg["payments"]["callbackSecretSet"], false);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "config.update",
        json!({ "section": "payments", "patch": { "callbackSecret": "s3cret" }, "actor": "admin" }),
    );
    assert_eq!(updated["config"]["payments"]["callbackSecretSet"], true);
    assert!(updated["config"]["payments"].get("callbackSecret").is_none());

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "config.update",
        json!({ "section": "results", "patch": { "resultAccessFee": -1 } }),
    );
    assert_eq!(code, "validation_failed");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "config.update",
        json!({ "section": "branding", "patch": {} }),
    );
    assert_eq!(code, "bad_params");

    let log = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activity.list",
        json!({ "actor": "admin" }),
    );
    assert_eq!(log["count"], 1);
    assert_eq!(log["entries"][0]["objectId"], "payments");
}

#[test]
fn maintenance_mode_blocks_everything_but_config_and_health() {
    let workspace = temp_dir("knecd-maintenance");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "config.update",
        json!({ "section": "maintenance", "patch": { "enabled": true, "message": "back at noon" } }),
    );

    let resp = test_support::request(&mut stdin, &mut reader, "3", "schools.list", json!({}));
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "maintenance");
    assert_eq!(resp["error"]["message"], "back at noon");

    let health = request_ok(&mut stdin, &mut reader, "4", "health", json!({}));
    assert_eq!(health["maintenance"], true);

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "config.update",
        json!({ "section": "maintenance", "patch": { "enabled": false } }),
    );
    request_ok(&mut stdin, &mut reader, "6", "schools.list", json!({}));
}
