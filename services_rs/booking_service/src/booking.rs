//! Booking Writer: turns a seat selection into a durable `pending` order with
//! its ticket rows, all inside one transaction. Seat conflicts are rejected
//! under a row lock and, should a race slip past the check, by the partial
//! unique index on (trip_id, seat_code).

use crate::coupons;
use crate::error::{ApiError, ApiResult};
use crate::models::TicketBrief;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{Row, Transaction};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const SEAT_TAKEN: &str = "SEAT_TAKEN";
const SEAT_UNIQUE_INDEX: &str = "uq_tickets_trip_seat";
const MAX_SEATS_PER_BOOKING: usize = 10;
const TICKET_CODE_ATTEMPTS: u32 = 5;

#[derive(Debug)]
pub struct BookingRequest {
    pub customer_id: String,
    pub trip_id: String,
    pub seat_codes: Vec<String>,
    pub pickup_point_id: String,
    pub dropoff_point_id: String,
    pub coupon_id: Option<String>,
    pub expected_total: Option<i64>,
}

#[derive(Debug)]
pub struct CreatedBooking {
    pub order_id: String,
    pub origin_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub currency: String,
    pub tickets: Vec<TicketBrief>,
}

fn seat_taken(seat: &str) -> ApiError {
    ApiError::conflict(format!("{SEAT_TAKEN}: seat {seat} is already held"))
}

fn is_seat_conflict(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.constraint())
        .map(|c| c == SEAT_UNIQUE_INDEX)
        .unwrap_or(false)
}

fn normalize_seat_codes(raw: &[String]) -> ApiResult<Vec<String>> {
    if raw.is_empty() {
        return Err(ApiError::bad_request("seat_codes cannot be empty"));
    }
    if raw.len() > MAX_SEATS_PER_BOOKING {
        return Err(ApiError::bad_request("too many seats in one booking"));
    }
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for s in raw {
        let seat = s.trim().to_ascii_uppercase();
        if seat.is_empty()
            || seat.len() > 6
            || !seat.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ApiError::bad_request("invalid seat code"));
        }
        if !seen.insert(seat.clone()) {
            return Err(ApiError::bad_request("seat_codes must be unique"));
        }
        out.push(seat);
    }
    Ok(out)
}

fn ticket_sig(ticket_secret: &str, code: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(ticket_secret.as_bytes()).expect("hmac key");
    mac.update(code.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Scannable payload for a ticket, derived from the code alone so it never
/// needs to be stored.
pub fn qr_payload(ticket_secret: &str, code: &str) -> String {
    let sig = ticket_sig(ticket_secret, code);
    format!("TKT|code={code}|sig={sig}")
}

fn code_candidate() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("VX-{}", &hex[..10])
}

async fn generate_ticket_code(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
) -> ApiResult<String> {
    let tickets = state.table("tickets");
    let sql = format!("SELECT 1 FROM {tickets} WHERE code=$1 LIMIT 1");
    for _ in 0..TICKET_CODE_ATTEMPTS {
        let code = code_candidate();
        let exists = sqlx::query(&sql)
            .bind(&code)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "db ticket code check failed");
                ApiError::internal("database error")
            })?
            .is_some();
        if !exists {
            return Ok(code);
        }
    }
    Ok(format!(
        "VX-{}",
        Uuid::new_v4().simple().to_string().to_uppercase()
    ))
}

async fn require_stop_point(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    point_id: &str,
    trip_id: &str,
    kind: &str,
) -> ApiResult<()> {
    let stop_points = state.table("stop_points");
    let sql = format!("SELECT kind FROM {stop_points} WHERE id=$1 AND trip_id=$2");
    let row = sqlx::query(&sql)
        .bind(point_id)
        .bind(trip_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db stop point lookup failed");
            ApiError::internal("database error")
        })?
        .ok_or_else(|| ApiError::bad_request(format!("unknown {kind} point for this trip")))?;
    let actual: String = row.try_get("kind").unwrap_or_default();
    if actual != kind {
        return Err(ApiError::bad_request(format!(
            "stop point is not a {kind} point"
        )));
    }
    Ok(())
}

pub async fn create_booking(
    state: &AppState,
    req: &BookingRequest,
    now: DateTime<Utc>,
) -> ApiResult<CreatedBooking> {
    let trip_id = req.trip_id.trim().to_string();
    if trip_id.is_empty() {
        return Err(ApiError::bad_request("trip_id required"));
    }
    let pickup_id = req.pickup_point_id.trim().to_string();
    let dropoff_id = req.dropoff_point_id.trim().to_string();
    if pickup_id.is_empty() || dropoff_id.is_empty() {
        return Err(ApiError::bad_request(
            "pickup_point_id and dropoff_point_id are required",
        ));
    }
    let seat_codes = normalize_seat_codes(&req.seat_codes)?;

    let customers = state.table("customers");
    let trips = state.table("trips");
    let tickets = state.table("tickets");
    let orders = state.table("orders");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let customer_known = sqlx::query(&format!("SELECT 1 FROM {customers} WHERE id=$1 LIMIT 1"))
        .bind(&req.customer_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db customer lookup failed");
            ApiError::internal("database error")
        })?
        .is_some();
    if !customer_known {
        return Err(ApiError::unauthorized("unknown customer"));
    }

    // Lock the trip row for the duration of the booking; concurrent bookings
    // for the same trip serialize here.
    let trip_row = sqlx::query(&format!(
        "SELECT id,price,currency,status FROM {trips} WHERE id=$1 FOR UPDATE"
    ))
    .bind(&trip_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db trip lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("trip not found"))?;
    let trip_status: String = trip_row.try_get("status").unwrap_or_else(|_| "open".to_string());
    if trip_status == "cancelled" {
        return Err(ApiError::bad_request("trip cancelled"));
    }
    let seat_price: i64 = trip_row.try_get("price").unwrap_or(0);
    let currency: String = trip_row
        .try_get("currency")
        .unwrap_or_else(|_| "VND".to_string());

    require_stop_point(&mut tx, state, &pickup_id, &trip_id, "pickup").await?;
    require_stop_point(&mut tx, state, &dropoff_id, &trip_id, "dropoff").await?;

    let taken_rows = sqlx::query(&format!(
        "SELECT seat_code FROM {tickets} WHERE trip_id=$1 AND status <> 'cancelled' FOR UPDATE"
    ))
    .bind(&trip_id)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db taken seats query failed");
        ApiError::internal("database error")
    })?;
    let mut taken: std::collections::HashSet<String> = std::collections::HashSet::new();
    for r in taken_rows {
        if let Ok(sc) = r.try_get::<String, _>("seat_code") {
            taken.insert(sc);
        }
    }
    for seat in &seat_codes {
        if taken.contains(seat) {
            return Err(seat_taken(seat));
        }
    }

    let origin_amount = seat_price * seat_codes.len() as i64;

    let applied = match req.coupon_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(coupon_id) => {
            match coupons::apply(&mut tx, state, coupon_id, &req.customer_id, origin_amount, now)
                .await?
            {
                Ok(a) => Some(a),
                Err(rej) => {
                    return Err(ApiError::bad_request(format!(
                        "{}: {}",
                        rej.code(),
                        rej.message()
                    )))
                }
            }
        }
        None => None,
    };
    let discount_amount = applied.as_ref().map(|a| a.discount_amount).unwrap_or(0);
    let final_amount = origin_amount - discount_amount;
    if let Some(expected) = req.expected_total {
        if expected != final_amount {
            return Err(ApiError::bad_request(
                "total changed since the quote; refresh and retry",
            ));
        }
    }

    let order_id = Uuid::new_v4().to_string();
    let now_s = now.to_rfc3339();
    sqlx::query(&format!(
        "INSERT INTO {orders} (id,customer_id,coupon_id,origin_amount,final_amount,status,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)"
    ))
    .bind(&order_id)
    .bind(&req.customer_id)
    .bind(applied.as_ref().map(|a| a.coupon_id.as_str()))
    .bind(origin_amount)
    .bind(final_amount)
    .bind("pending")
    .bind(&now_s)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db order insert failed");
        ApiError::internal("database error")
    })?;

    let mut out_tickets: Vec<TicketBrief> = Vec::with_capacity(seat_codes.len());
    for seat in &seat_codes {
        let ticket_id = Uuid::new_v4().to_string();
        let code = generate_ticket_code(&mut tx, state).await?;
        sqlx::query(&format!(
            "INSERT INTO {tickets} (id,code,order_id,trip_id,seat_code,pickup_point_id,dropoff_point_id,status,purchased_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"
        ))
        .bind(&ticket_id)
        .bind(&code)
        .bind(&order_id)
        .bind(&trip_id)
        .bind(seat)
        .bind(&pickup_id)
        .bind(&dropoff_id)
        .bind("pending")
        .bind(&now_s)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_seat_conflict(&e) {
                return seat_taken(seat);
            }
            tracing::error!(error = %e, "db ticket insert failed");
            ApiError::internal("database error")
        })?;
        out_tickets.push(TicketBrief {
            id: ticket_id,
            code: code.clone(),
            seat_code: seat.clone(),
            status: "pending".to_string(),
            qr_payload: qr_payload(&state.ticket_secret, &code),
        });
    }

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    Ok(CreatedBooking {
        order_id,
        origin_amount,
        discount_amount,
        final_amount,
        currency,
        tickets: out_tickets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_codes_are_trimmed_uppercased_and_deduplicated() {
        let out =
            normalize_seat_codes(&[" a1 ".to_string(), "B12".to_string()]).expect("normalize");
        assert_eq!(out, vec!["A1".to_string(), "B12".to_string()]);

        let err = normalize_seat_codes(&["A1".to_string(), "a1".to_string()])
            .expect_err("duplicates must be rejected");
        assert!(err.detail.contains("unique"));
    }

    #[test]
    fn seat_codes_reject_empty_and_malformed() {
        assert!(normalize_seat_codes(&[]).is_err());
        assert!(normalize_seat_codes(&["".to_string()]).is_err());
        assert!(normalize_seat_codes(&["A-1".to_string()]).is_err());
        assert!(normalize_seat_codes(&["ABCDEFG".to_string()]).is_err());
        let many: Vec<String> = (1..=11).map(|n| format!("A{n}")).collect();
        assert!(normalize_seat_codes(&many).is_err());
    }

    #[test]
    fn qr_payload_is_deterministic_and_signed() {
        let a = qr_payload("ticket-secret-test", "VX-00AA11BB22");
        let b = qr_payload("ticket-secret-test", "VX-00AA11BB22");
        assert_eq!(a, b);
        assert!(a.starts_with("TKT|code=VX-00AA11BB22|sig="));

        let sig = a.rsplit_once("sig=").map(|(_, s)| s.to_string()).unwrap();
        assert_eq!(sig, ticket_sig("ticket-secret-test", "VX-00AA11BB22"));
        assert_ne!(
            sig,
            ticket_sig("another-secret", "VX-00AA11BB22"),
            "payload must be keyed by the ticket secret"
        );
    }

    #[test]
    fn ticket_code_candidates_are_short_and_uppercase() {
        let code = code_candidate();
        assert_eq!(code.len(), 13);
        assert!(code.starts_with("VX-"));
        assert!(code[3..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn seat_taken_error_carries_reason_code() {
        let err = seat_taken("A1");
        assert_eq!(err.status, axum::http::StatusCode::CONFLICT);
        assert!(err.detail.starts_with("SEAT_TAKEN:"));
    }
}
