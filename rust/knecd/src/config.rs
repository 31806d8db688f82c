use crate::db;
use crate::error::{ExamError, ExamResult};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

pub const CALLBACK_SECRET_ENV: &str = "KNECD_CALLBACK_SECRET";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigSection {
    Results,
    MarksEntry,
    Payments,
    Maintenance,
}

impl ConfigSection {
    pub const ALL: [ConfigSection; 4] = [
        ConfigSection::Results,
        ConfigSection::MarksEntry,
        ConfigSection::Payments,
        ConfigSection::Maintenance,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "results" => Some(Self::Results),
            "marksEntry" => Some(Self::MarksEntry),
            "payments" => Some(Self::Payments),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Results => "results",
            Self::MarksEntry => "marksEntry",
            Self::Payments => "payments",
            Self::Maintenance => "maintenance",
        }
    }

    fn key(self) -> String {
        format!("config.{}", self.name())
    }
}

fn default_section(section: ConfigSection) -> Value {
    match section {
        ConfigSection::Results => json!({
            "resultAccessFee": 50.0,
            "releaseEnabled": false
        }),
        ConfigSection::MarksEntry => json!({
            "enabled": true,
            "deadline": null,
            "defaultValidityDays": 30
        }),
        ConfigSection::Payments => json!({
            "callbackSecret": "",
            "currency": "KES"
        }),
        ConfigSection::Maintenance => json!({
            "enabled": false,
            "message": ""
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{key} must be a boolean"))
}

fn parse_string_max(v: &Value, key: &str, max: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{key} must be a string"))?;
    if s.chars().count() > max {
        return Err(format!("{key} must be at most {max} characters"));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: ConfigSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "config section must be a JSON object".to_string())?;

    for (k, v) in patch {
        let value = match (section, k.as_str()) {
            (ConfigSection::Results, "resultAccessFee") => {
                let fee = v
                    .as_f64()
                    .ok_or_else(|| "resultAccessFee must be a number".to_string())?;
                if !(0.0..=100_000.0).contains(&fee) {
                    return Err("resultAccessFee must be within 0..=100000".to_string());
                }
                json!(fee)
            }
            (ConfigSection::Results, "releaseEnabled")
            | (ConfigSection::MarksEntry, "enabled")
            | (ConfigSection::Maintenance, "enabled") => Value::Bool(parse_bool(v, k)?),
            (ConfigSection::MarksEntry, "deadline") => {
                if v.is_null() {
                    Value::Null
                } else {
                    let s = v
                        .as_str()
                        .ok_or_else(|| "deadline must be an RFC 3339 string or null".to_string())?;
                    DateTime::parse_from_rfc3339(s)
                        .map_err(|_| "deadline must be an RFC 3339 timestamp".to_string())?;
                    Value::String(s.to_string())
                }
            }
            (ConfigSection::MarksEntry, "defaultValidityDays") => {
                let days = v
                    .as_i64()
                    .ok_or_else(|| "defaultValidityDays must be an integer".to_string())?;
                if !(1..=365).contains(&days) {
                    return Err("defaultValidityDays must be within 1..=365".to_string());
                }
                json!(days)
            }
            (ConfigSection::Payments, "callbackSecret") => {
                Value::String(parse_string_max(v, k, 256)?)
            }
            (ConfigSection::Payments, "currency") => {
                let c = parse_string_max(v, k, 3)?;
                if c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_uppercase()) {
                    return Err("currency must be a 3-letter code".to_string());
                }
                Value::String(c)
            }
            (ConfigSection::Maintenance, "message") => Value::String(parse_string_max(v, k, 500)?),
            _ => return Err(format!("unknown {} field: {}", section.name(), k)),
        };
        obj.insert(k.clone(), value);
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: ConfigSection) -> ExamResult<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Stale or malformed stored fields fall back to defaults.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &one);
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: ConfigSection,
    patch: &Map<String, Value>,
) -> ExamResult<Value> {
    let mut current = load_section(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(ExamError::validation)?;
    db::settings_set_json(conn, &section.key(), &current)?;
    tracing::info!(section = section.name(), "configuration updated");
    Ok(current)
}

/// Sections as shown to callers; the callback secret is never echoed back.
pub fn public_view(conn: &Connection) -> ExamResult<Value> {
    let mut out = Map::new();
    for section in ConfigSection::ALL {
        let mut v = load_section(conn, section)?;
        if section == ConfigSection::Payments {
            if let Some(obj) = v.as_object_mut() {
                let set = obj
                    .remove("callbackSecret")
                    .and_then(|s| s.as_str().map(|s| !s.is_empty()))
                    .unwrap_or(false);
                obj.insert(
                    "callbackSecretSet".to_string(),
                    Value::Bool(set || std::env::var(CALLBACK_SECRET_ENV).is_ok()),
                );
            }
        }
        out.insert(section.name().to_string(), v);
    }
    Ok(Value::Object(out))
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub result_access_fee_cents: i64,
    pub release_enabled: bool,
    pub marks_entry_enabled: bool,
    pub marks_entry_deadline: Option<DateTime<Utc>>,
    pub default_validity_days: i64,
    pub callback_secret: String,
    pub currency: String,
    pub maintenance_enabled: bool,
    pub maintenance_message: String,
}

impl SystemConfig {
    pub fn load(conn: &Connection) -> ExamResult<Self> {
        let results = load_section(conn, ConfigSection::Results)?;
        let marks = load_section(conn, ConfigSection::MarksEntry)?;
        let payments = load_section(conn, ConfigSection::Payments)?;
        let maintenance = load_section(conn, ConfigSection::Maintenance)?;

        let fee = results["resultAccessFee"].as_f64().unwrap_or(50.0);
        let deadline = marks["deadline"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        let callback_secret = std::env::var(CALLBACK_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| payments["callbackSecret"].as_str().unwrap_or("").to_string());

        Ok(Self {
            result_access_fee_cents: (fee * 100.0).round() as i64,
            release_enabled: results["releaseEnabled"].as_bool().unwrap_or(false),
            marks_entry_enabled: marks["enabled"].as_bool().unwrap_or(true),
            marks_entry_deadline: deadline,
            default_validity_days: marks["defaultValidityDays"].as_i64().unwrap_or(30),
            callback_secret,
            currency: payments["currency"].as_str().unwrap_or("KES").to_string(),
            maintenance_enabled: maintenance["enabled"].as_bool().unwrap_or(false),
            maintenance_message: maintenance["message"].as_str().unwrap_or("").to_string(),
        })
    }
}
