use crate::aggregate::{self, CandidateResults};
use crate::audit::{self, Activity, FraudKind, FraudReport};
use crate::config::SystemConfig;
use crate::db::now_rfc3339;
use crate::error::{ExamError, ExamResult};
use crate::identity;
use crate::registry;
use rusqlite::{Connection, OptionalExtension};
use rusqlite::{Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Result code the payment gateway uses when the payer cancels the prompt.
pub const RESULT_CODE_CANCELLED: i64 = 1032;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "cancelled" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn from_result_code(code: i64) -> Self {
        match code {
            0 => PaymentStatus::Completed,
            RESULT_CODE_CANCELLED => PaymentStatus::Cancelled,
            _ => PaymentStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != PaymentStatus::Pending
    }
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Lowercase hex SHA-256 over
/// `secret|checkoutRequestId|merchantRequestId|resultCode|receipt|amountCents`.
pub fn callback_signature(
    secret: &str,
    checkout_request_id: &str,
    merchant_request_id: &str,
    result_code: i64,
    receipt: &str,
    amount_cents: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    for part in [
        checkout_request_id.to_string(),
        merchant_request_id.to_string(),
        result_code.to_string(),
        receipt.to_string(),
        amount_cents.to_string(),
    ] {
        hasher.update(b"|");
        hasher.update(part.as_bytes());
    }
    to_hex(&hasher.finalize())
}

fn signatures_match(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.trim().to_ascii_lowercase().into_bytes());
    a.len() == b.len() && a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub transaction_id: String,
    pub candidate_id: String,
    pub index_number: String,
    pub phone: String,
    pub amount_cents: i64,
    pub currency: String,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub receipt: String,
    pub status: String,
    pub result_code: Option<i64>,
    pub result_desc: String,
    pub paid_at: Option<String>,
    pub result_accessed: bool,
    pub created_at: String,
}

const PAYMENT_SELECT: &str = "SELECT p.id, p.candidate_id, c.index_number, p.phone, p.amount_cents,
    p.currency, p.merchant_request_id, p.checkout_request_id, p.receipt, p.status, p.result_code,
    p.result_desc, p.paid_at, p.result_accessed, p.created_at
  FROM payments p
  JOIN candidates c ON c.id = p.candidate_id";

fn payment_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    Ok(PaymentRecord {
        transaction_id: r.get(0)?,
        candidate_id: r.get(1)?,
        index_number: r.get(2)?,
        phone: r.get(3)?,
        amount_cents: r.get(4)?,
        currency: r.get(5)?,
        merchant_request_id: r.get(6)?,
        checkout_request_id: r.get(7)?,
        receipt: r.get(8)?,
        status: r.get(9)?,
        result_code: r.get(10)?,
        result_desc: r.get(11)?,
        paid_at: r.get(12)?,
        result_accessed: r.get::<_, i64>(13)? != 0,
        created_at: r.get(14)?,
    })
}

fn find_payment(conn: &Connection, column: &str, value: &str) -> ExamResult<Option<PaymentRecord>> {
    let p = conn
        .query_row(
            &format!("{PAYMENT_SELECT} WHERE p.{column} = ?"),
            [value],
            payment_from_row,
        )
        .optional()?;
    Ok(p)
}

pub fn get_payment(conn: &Connection, transaction_id: &str) -> ExamResult<PaymentRecord> {
    find_payment(conn, "id", transaction_id.trim())?
        .ok_or_else(|| ExamError::not_found("payment", transaction_id))
}

/// Record a pending result-access payment for a candidate.
///
/// The gateway push itself is outside this service: the caller receives the
/// merchant and checkout request ids to hand to the gateway, and the outcome
/// arrives later through [`apply_callback`].
pub fn initiate_payment(
    conn: &Connection,
    cfg: &SystemConfig,
    index_number: &str,
    phone: &str,
    actor: Option<&str>,
    ip_address: Option<&str>,
) -> ExamResult<PaymentRecord> {
    let candidate = registry::get_candidate_guarded(conn, index_number, actor, ip_address)?;
    let phone = identity::validate_phone(phone)?;
    if cfg.result_access_fee_cents <= 0 {
        return Err(ExamError::Configuration(
            "resultAccessFee must be positive to take payments".into(),
        ));
    }

    let entitled: Option<String> = conn
        .query_row(
            "SELECT transaction_id FROM entitlements WHERE candidate_id = ?",
            [&candidate.id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(existing) = entitled {
        let report = FraudReport::new(
            FraudKind::MultiplePayment,
            format!(
                "payment initiated for {} which is already paid by {existing}",
                candidate.index_number
            ),
        )
        .actor(actor)
        .index_number(&candidate.index_number)
        .phone(&phone)
        .ip_address(ip_address);
        return Err(audit::reject_as_fraud(conn, &report));
    }

    let id = Uuid::new_v4().to_string();
    let merchant_request_id = format!("MR-{}", Uuid::new_v4().simple());
    let checkout_request_id = format!("ws_CO_{}", Uuid::new_v4().simple());
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO payments(
            id, candidate_id, phone, amount_cents, currency, merchant_request_id,
            checkout_request_id, status, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        (
            &id,
            &candidate.id,
            &phone,
            cfg.result_access_fee_cents,
            &cfg.currency,
            &merchant_request_id,
            &checkout_request_id,
            &now,
            &now,
        ),
    )?;
    audit::log_activity(
        conn,
        actor,
        Activity::Payment,
        &format!(
            "payment of {} {} initiated for {}",
            cfg.result_access_fee_cents, cfg.currency, candidate.index_number
        ),
        "payment",
        &id,
    )?;
    tracing::info!(
        transaction_id = %id,
        index_number = %candidate.index_number,
        amount_cents = cfg.result_access_fee_cents,
        "payment initiated"
    );
    get_payment(conn, &id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub result_code: i64,
    #[serde(default)]
    pub result_desc: String,
    #[serde(default)]
    pub receipt: String,
    #[serde(default)]
    pub amount_cents: i64,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackOutcome {
    pub transaction_id: String,
    pub status: String,
    pub duplicate: bool,
    pub entitlement_granted: bool,
}

fn reject_callback(payload: &CallbackPayload, reason: &str) -> ExamError {
    tracing::warn!(
        checkout_request_id = %payload.checkout_request_id,
        reason,
        "payment callback rejected"
    );
    ExamError::PaymentRejected(reason.to_string())
}

/// Apply a gateway confirmation to its pending payment.
///
/// Verification happens before any write. Replaying a confirmation whose
/// outcome is already recorded returns `duplicate: true` and changes nothing;
/// a confirmation that contradicts the recorded outcome is refused.
pub fn apply_callback(
    conn: &Connection,
    cfg: &SystemConfig,
    payload: &CallbackPayload,
) -> ExamResult<CallbackOutcome> {
    if cfg.callback_secret.is_empty() {
        return Err(ExamError::Configuration(
            "payments.callbackSecret is not configured".into(),
        ));
    }
    let Some(payment) = find_payment(conn, "checkout_request_id", payload.checkout_request_id.trim())?
    else {
        return Err(reject_callback(payload, "unknown checkout request id"));
    };
    if payment.merchant_request_id != payload.merchant_request_id.trim() {
        return Err(reject_callback(payload, "merchant request id does not match"));
    }
    let expected = callback_signature(
        &cfg.callback_secret,
        &payment.checkout_request_id,
        &payment.merchant_request_id,
        payload.result_code,
        payload.receipt.trim(),
        payload.amount_cents,
    );
    if !signatures_match(&expected, &payload.signature) {
        return Err(reject_callback(payload, "signature mismatch"));
    }

    let outcome = PaymentStatus::from_result_code(payload.result_code);
    if outcome == PaymentStatus::Completed {
        if payload.amount_cents != payment.amount_cents {
            return Err(reject_callback(payload, "amount does not match the initiated payment"));
        }
        if payload.receipt.trim().is_empty() {
            return Err(reject_callback(payload, "completed payment carries no receipt"));
        }
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let (status, receipt): (String, String) = tx.query_row(
        "SELECT status, receipt FROM payments WHERE id = ?",
        [&payment.transaction_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let current = PaymentStatus::parse(&status).ok_or_else(|| {
        ExamError::Database(format!("payment {} has unknown status {status}", payment.transaction_id))
    })?;

    if current.is_terminal() {
        let same = current == outcome && receipt == payload.receipt.trim();
        if same {
            tracing::info!(transaction_id = %payment.transaction_id, "duplicate payment callback ignored");
            return Ok(CallbackOutcome {
                transaction_id: payment.transaction_id,
                status,
                duplicate: true,
                entitlement_granted: false,
            });
        }
        tracing::warn!(
            transaction_id = %payment.transaction_id,
            recorded = %status,
            incoming = outcome.as_str(),
            "payment callback contradicts recorded outcome"
        );
        return Err(ExamError::CallbackConflict(format!(
            "transaction {} is already {status}",
            payment.transaction_id
        )));
    }

    let now = now_rfc3339();
    tx.execute(
        "UPDATE payments
         SET status = ?, result_code = ?, result_desc = ?, receipt = ?, paid_at = ?, updated_at = ?
         WHERE id = ?",
        (
            outcome.as_str(),
            payload.result_code,
            payload.result_desc.trim(),
            payload.receipt.trim(),
            (outcome == PaymentStatus::Completed).then(|| now.clone()),
            &now,
            &payment.transaction_id,
        ),
    )?;

    let mut granted = false;
    if outcome == PaymentStatus::Completed {
        granted = tx.execute(
            "INSERT OR IGNORE INTO entitlements(candidate_id, transaction_id, granted_at)
             VALUES(?, ?, ?)",
            (&payment.candidate_id, &payment.transaction_id, &now),
        )? == 1;
        if !granted {
            // Two prompts for the same candidate were both paid.
            audit::record_fraud(
                &tx,
                &FraudReport::new(
                    FraudKind::MultiplePayment,
                    format!(
                        "second completed payment {} for an already entitled candidate",
                        payment.transaction_id
                    ),
                )
                .index_number(&payment.index_number)
                .phone(&payment.phone),
            )?;
        }
    }
    audit::log_activity(
        &tx,
        None,
        Activity::Payment,
        &format!(
            "payment {} for {} {}",
            payment.transaction_id,
            payment.index_number,
            outcome.as_str()
        ),
        "payment",
        &payment.transaction_id,
    )?;
    tx.commit()?;

    tracing::info!(
        transaction_id = %payment.transaction_id,
        status = outcome.as_str(),
        granted,
        "payment callback applied"
    );
    Ok(CallbackOutcome {
        transaction_id: payment.transaction_id,
        status: outcome.as_str().to_string(),
        duplicate: false,
        entitlement_granted: granted,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementView {
    pub index_number: String,
    pub entitled: bool,
    pub transaction_id: Option<String>,
    pub granted_at: Option<String>,
}

pub fn entitlement(
    conn: &Connection,
    index_number: &str,
    actor: Option<&str>,
    ip_address: Option<&str>,
) -> ExamResult<EntitlementView> {
    let candidate = registry::get_candidate_guarded(conn, index_number, actor, ip_address)?;
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT transaction_id, granted_at FROM entitlements WHERE candidate_id = ?",
            [&candidate.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (transaction_id, granted_at) = row.unzip();
    Ok(EntitlementView {
        index_number: candidate.index_number,
        entitled: transaction_id.is_some(),
        transaction_id,
        granted_at,
    })
}

/// Released results for a paying candidate. The access is stamped on the
/// granting payment.
pub fn access_results(
    conn: &Connection,
    cfg: &SystemConfig,
    index_number: &str,
    actor: Option<&str>,
    ip_address: Option<&str>,
) -> ExamResult<CandidateResults> {
    if !cfg.release_enabled {
        return Err(ExamError::Forbidden("result access is not open".into()));
    }
    let candidate = registry::get_candidate_guarded(conn, index_number, actor, ip_address)?;
    if !aggregate::is_released(conn, &candidate.id)? {
        return Err(ExamError::Forbidden(format!(
            "results for {} are not released",
            candidate.index_number
        )));
    }
    let txn: Option<String> = conn
        .query_row(
            "SELECT transaction_id FROM entitlements WHERE candidate_id = ?",
            [&candidate.id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(txn) = txn else {
        let report = FraudReport::new(
            FraudKind::UnauthorizedAccess,
            format!("result access for {} without payment", candidate.index_number),
        )
        .actor(actor)
        .index_number(&candidate.index_number)
        .ip_address(ip_address);
        audit::record_fraud(conn, &report)?;
        return Err(ExamError::Forbidden(
            "result access requires a completed payment".into(),
        ));
    };

    let now = now_rfc3339();
    conn.execute(
        "UPDATE payments SET result_accessed = 1, accessed_at = ?, access_ip = ?, updated_at = ?
         WHERE id = ?",
        (&now, ip_address, &now, &txn),
    )?;
    audit::log_activity(
        conn,
        actor,
        Activity::ResultAccess,
        &format!("results viewed for {}", candidate.index_number),
        "candidate",
        &candidate.id,
    )?;
    aggregate::candidate_results(conn, candidate)
}
