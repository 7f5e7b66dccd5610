use crate::booking::{self, BookingRequest};
use crate::coupons;
use crate::error::{ApiError, ApiResult};
use crate::gateway::{self, form_encode};
use crate::models::*;
use crate::reconcile;
use crate::rows::{make_in_clause, normalize_limit, row_dt_opt};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::HashMap;

const CUSTOMER_ID_HEADER: &str = "x-customer-id";

pub async fn health(State(state): State<AppState>) -> axum::Json<HealthOut> {
    axum::Json(HealthOut {
        status: "ok",
        env: state.env_name.clone(),
        service: "Booking API",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Caller identity as established by the upstream gateway. Token issuance and
/// verification live upstream; by the time a request reaches this service the
/// verified customer id is a plain header behind internal auth.
fn require_customer(headers: &HeaderMap) -> ApiResult<String> {
    let raw = headers
        .get(CUSTOMER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if raw.is_empty()
        || raw.len() > 64
        || !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(ApiError::unauthorized("customer identity required"));
    }
    Ok(raw.to_string())
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

pub async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<BookingReq>,
) -> ApiResult<axum::Json<BookingOut>> {
    let customer_id = require_customer(&headers)?;
    let Some(gw) = state.gateway.clone() else {
        return Err(ApiError::internal("payment gateway not configured"));
    };

    let req = BookingRequest {
        customer_id,
        trip_id: body.trip_id,
        seat_codes: body.seat_codes,
        pickup_point_id: body.pickup_point_id,
        dropoff_point_id: body.dropoff_point_id,
        coupon_id: body.coupon_id,
        expected_total: body.expected_total,
    };
    let created = booking::create_booking(&state, &req, Utc::now()).await?;

    let payment_url = gateway::build_redirect(
        &gw,
        &created.order_id,
        created.final_amount,
        &client_ip(&headers),
        Utc::now(),
    );

    Ok(axum::Json(BookingOut {
        order_id: created.order_id,
        status: reconcile::ORDER_PENDING.to_string(),
        origin_amount: created.origin_amount,
        discount_amount: created.discount_amount,
        final_amount: created.final_amount,
        currency: created.currency,
        tickets: created.tickets,
        payment_url,
    }))
}

fn result_redirect(state: &AppState, order_ref: &str, paid: bool) -> Redirect {
    let base = state
        .result_page_url
        .as_deref()
        .unwrap_or("/payments/result");
    let status = if paid { "paid" } else { "failed" };
    let url = format!("{base}?orderRef={}&status={status}", form_encode(order_ref));
    Redirect::temporary(&url)
}

/// Browser-facing gateway return. A bad signature or malformed callback is a
/// hard rejection; once the callback is authenticated the customer is always
/// sent to the result page, even when reconciliation itself hits a storage
/// error (operators recover those from the logs).
pub async fn payment_return(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Redirect> {
    let Some(gw) = state.gateway.clone() else {
        return Err(ApiError::internal("payment gateway not configured"));
    };
    let outcome = gateway::verify_callback(&gw, &params)?;

    match reconcile::settle(&state, &outcome).await {
        Ok(settled) => Ok(result_redirect(
            &state,
            &settled.order_id,
            settled.status == reconcile::ORDER_COMPLETED,
        )),
        Err(e) if e.status == StatusCode::NOT_FOUND || e.status == StatusCode::BAD_REQUEST => {
            Err(e)
        }
        Err(e) => {
            tracing::error!(
                order_ref = %outcome.order_ref,
                detail = %e.detail,
                "reconciliation failed after authenticated callback"
            );
            Ok(result_redirect(&state, &outcome.order_ref, false))
        }
    }
}

pub async fn preview_coupon(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<CouponPreviewReq>,
) -> ApiResult<axum::Json<CouponPreviewOut>> {
    let customer_id = require_customer(&headers)?;
    let coupon_id = body.coupon_id.trim().to_string();
    if coupon_id.is_empty() {
        return Err(ApiError::bad_request("coupon_id required"));
    }
    if body.amount <= 0 {
        return Err(ApiError::bad_request("amount must be > 0"));
    }

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;
    let validated =
        coupons::validate(&mut tx, &state, &coupon_id, &customer_id, Utc::now()).await;
    tx.rollback().await.ok();

    let out = match validated? {
        Ok(coupon) => {
            let discount = coupons::compute_discount(
                coupon.kind,
                coupon.value,
                coupon.max_discount,
                body.amount,
            );
            CouponPreviewOut {
                ok: true,
                reason: None,
                message: None,
                discount_amount: Some(discount),
                final_amount: Some(body.amount - discount),
            }
        }
        Err(rej) => CouponPreviewOut {
            ok: false,
            reason: Some(rej.code()),
            message: Some(rej.message()),
            discount_amount: None,
            final_amount: None,
        },
    };
    Ok(axum::Json(out))
}

pub async fn abandon_order(
    Path(order_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<axum::Json<AbandonOut>> {
    let order_id = order_id.trim().to_string();
    if order_id.is_empty() {
        return Err(ApiError::bad_request("order_id required"));
    }
    let settled = reconcile::settle_failure(&state, &order_id).await?;
    Ok(axum::Json(AbandonOut {
        order_id: settled.order_id,
        status: settled.status,
        changed: settled.changed,
    }))
}

fn trip_out_from_row(row: &PgRow) -> TripOut {
    TripOut {
        id: row.try_get("id").unwrap_or_default(),
        label: row.try_get("label").unwrap_or_default(),
        depart_at: row_dt_opt(row, "depart_at"),
        arrive_at: row_dt_opt(row, "arrive_at"),
    }
}

async fn fetch_trip(state: &AppState, trip_id: &str) -> ApiResult<Option<TripOut>> {
    let trips = state.table("trips");
    let row = sqlx::query(&format!(
        "SELECT id,label,depart_at,arrive_at FROM {trips} WHERE id=$1"
    ))
    .bind(trip_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db trip lookup failed");
        ApiError::internal("database error")
    })?;
    Ok(row.as_ref().map(trip_out_from_row))
}

async fn fetch_stop_point(state: &AppState, point_id: &str) -> Option<StopPointOut> {
    let stop_points = state.table("stop_points");
    let row = sqlx::query(&format!(
        "SELECT id,name,scheduled_at FROM {stop_points} WHERE id=$1"
    ))
    .bind(point_id)
    .fetch_optional(&state.pool)
    .await
    .ok()
    .flatten()?;
    Some(StopPointOut {
        id: row.try_get("id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        scheduled_at: row_dt_opt(&row, "scheduled_at"),
    })
}

/// Public ticket lookup. The email+phone pair is the only credential: both
/// must match the owning customer's stored contact details exactly, and an
/// unknown code is indistinguishable from one the caller may not see.
pub async fn lookup_ticket(
    State(state): State<AppState>,
    Query(params): Query<LookupParams>,
) -> ApiResult<axum::Json<TicketDetailOut>> {
    let email = params.email.trim().to_string();
    let phone = params.phone.trim().to_string();
    let code = params.code.trim().to_string();
    if email.is_empty() || phone.is_empty() || code.is_empty() {
        return Err(ApiError::bad_request("email, phone and code are required"));
    }

    let tickets = state.table("tickets");
    let orders = state.table("orders");
    let customers = state.table("customers");
    let transactions = state.table("transactions");
    let coupons_table = state.table("coupons");

    let ticket = sqlx::query(&format!(
        "SELECT id,code,order_id,trip_id,seat_code,pickup_point_id,dropoff_point_id,status,\
         purchased_at,checked_in_at FROM {tickets} WHERE code=$1"
    ))
    .bind(&code)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db ticket lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ticket not found"))?;

    let order_id: String = ticket.try_get("order_id").unwrap_or_default();
    let order = sqlx::query(&format!(
        "SELECT id,customer_id,coupon_id,origin_amount,final_amount,status,created_at \
         FROM {orders} WHERE id=$1"
    ))
    .bind(&order_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db order lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| {
        tracing::error!(order_id = %order_id, "ticket references missing order");
        ApiError::internal("database error")
    })?;

    let customer_id: String = order.try_get("customer_id").unwrap_or_default();
    let customer = sqlx::query(&format!(
        "SELECT full_name,email,phone FROM {customers} WHERE id=$1"
    ))
    .bind(&customer_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db customer lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| {
        tracing::error!(customer_id = %customer_id, "order references missing customer");
        ApiError::internal("database error")
    })?;

    let stored_email: String = customer.try_get("email").unwrap_or_default();
    let stored_phone: String = customer.try_get("phone").unwrap_or_default();
    if !stored_email.trim().eq_ignore_ascii_case(&email) || stored_phone.trim() != phone {
        return Err(ApiError::unauthorized("contact details do not match"));
    }

    let trip_id: String = ticket.try_get("trip_id").unwrap_or_default();
    let trip = fetch_trip(&state, &trip_id).await?.unwrap_or(TripOut {
        id: trip_id,
        label: String::new(),
        depart_at: None,
        arrive_at: None,
    });

    let pickup = match ticket.try_get::<Option<String>, _>("pickup_point_id") {
        Ok(Some(id)) if !id.is_empty() => fetch_stop_point(&state, &id).await,
        _ => None,
    };
    let dropoff = match ticket.try_get::<Option<String>, _>("dropoff_point_id") {
        Ok(Some(id)) if !id.is_empty() => fetch_stop_point(&state, &id).await,
        _ => None,
    };

    let transaction = sqlx::query(&format!(
        "SELECT id,amount,method,status,created_at FROM {transactions} WHERE order_id=$1"
    ))
    .bind(&order_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db transaction lookup failed");
        ApiError::internal("database error")
    })?
    .map(|r| TransactionOut {
        id: r.try_get("id").unwrap_or_default(),
        amount: r.try_get("amount").unwrap_or(0),
        method: r.try_get("method").unwrap_or_default(),
        status: r.try_get("status").unwrap_or_default(),
        created_at: row_dt_opt(&r, "created_at"),
    });

    let coupon = match order.try_get::<Option<String>, _>("coupon_id") {
        Ok(Some(coupon_id)) if !coupon_id.is_empty() => sqlx::query(&format!(
            "SELECT id,code,discount_type,discount_value FROM {coupons_table} WHERE id=$1"
        ))
        .bind(&coupon_id)
        .fetch_optional(&state.pool)
        .await
        .ok()
        .flatten()
        .map(|r| CouponSummaryOut {
            id: r.try_get("id").unwrap_or_default(),
            code: r.try_get("code").unwrap_or_default(),
            discount_type: r.try_get("discount_type").unwrap_or_default(),
            discount_value: r.try_get("discount_value").unwrap_or(0),
        }),
        _ => None,
    };

    let ticket_code: String = ticket.try_get("code").unwrap_or_default();
    Ok(axum::Json(TicketDetailOut {
        qr_payload: booking::qr_payload(&state.ticket_secret, &ticket_code),
        code: ticket_code,
        seat_code: ticket.try_get("seat_code").unwrap_or_default(),
        status: ticket.try_get("status").unwrap_or_default(),
        purchased_at: row_dt_opt(&ticket, "purchased_at"),
        checked_in_at: row_dt_opt(&ticket, "checked_in_at"),
        holder_name: customer.try_get("full_name").unwrap_or_default(),
        trip,
        pickup,
        dropoff,
        order: OrderSummaryOut {
            id: order.try_get("id").unwrap_or_default(),
            status: order.try_get("status").unwrap_or_default(),
            origin_amount: order.try_get("origin_amount").unwrap_or(0),
            final_amount: order.try_get("final_amount").unwrap_or(0),
            created_at: row_dt_opt(&order, "created_at"),
        },
        transaction,
        coupon,
    }))
}

pub async fn my_tickets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<MyTicketsParams>,
) -> ApiResult<axum::Json<Vec<MyTicketOut>>> {
    let customer_id = require_customer(&headers)?;
    let limit = normalize_limit(params.limit, 20, 1, 100);

    let orders = state.table("orders");
    let tickets = state.table("tickets");
    let trips = state.table("trips");

    let order_rows = sqlx::query(&format!(
        "SELECT id,status FROM {orders} WHERE customer_id=$1"
    ))
    .bind(&customer_id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db my_tickets orders failed");
        ApiError::internal("database error")
    })?;
    if order_rows.is_empty() {
        return Ok(axum::Json(vec![]));
    }

    let mut order_ids: Vec<String> = Vec::with_capacity(order_rows.len());
    let mut order_status: HashMap<String, String> = HashMap::new();
    for r in order_rows {
        let id: String = r.try_get("id").unwrap_or_default();
        let status: String = r.try_get("status").unwrap_or_default();
        if !id.is_empty() {
            order_ids.push(id.clone());
            order_status.insert(id, status);
        }
    }

    let sql = format!(
        "SELECT code,order_id,trip_id,seat_code,status,purchased_at FROM {tickets} \
         WHERE order_id IN {} ORDER BY purchased_at DESC LIMIT ${}",
        make_in_clause(1, order_ids.len()),
        order_ids.len() + 1
    );
    let mut q = sqlx::query(&sql);
    for oid in &order_ids {
        q = q.bind(oid);
    }
    q = q.bind(limit);
    let ticket_rows = q.fetch_all(&state.pool).await.map_err(|e| {
        tracing::error!(error = %e, "db my_tickets tickets failed");
        ApiError::internal("database error")
    })?;

    let mut trip_ids: Vec<String> = Vec::new();
    for r in &ticket_rows {
        if let Ok(tid) = r.try_get::<String, _>("trip_id") {
            if !tid.is_empty() && !trip_ids.contains(&tid) {
                trip_ids.push(tid);
            }
        }
    }
    let mut trip_map: HashMap<String, TripOut> = HashMap::new();
    if !trip_ids.is_empty() {
        let sql = format!(
            "SELECT id,label,depart_at,arrive_at FROM {trips} WHERE id IN {}",
            make_in_clause(1, trip_ids.len())
        );
        let mut q = sqlx::query(&sql);
        for tid in &trip_ids {
            q = q.bind(tid);
        }
        let rows = q.fetch_all(&state.pool).await.map_err(|e| {
            tracing::error!(error = %e, "db my_tickets trips failed");
            ApiError::internal("database error")
        })?;
        for r in rows {
            let t = trip_out_from_row(&r);
            trip_map.insert(t.id.clone(), t);
        }
    }

    let mut out: Vec<MyTicketOut> = Vec::with_capacity(ticket_rows.len());
    for r in ticket_rows {
        let order_id: String = r.try_get("order_id").unwrap_or_default();
        let trip_id: String = r.try_get("trip_id").unwrap_or_default();
        out.push(MyTicketOut {
            code: r.try_get("code").unwrap_or_default(),
            seat_code: r.try_get("seat_code").unwrap_or_default(),
            status: r.try_get("status").unwrap_or_default(),
            purchased_at: row_dt_opt(&r, "purchased_at"),
            trip: trip_map.get(&trip_id).cloned(),
            order_status: order_status.get(&order_id).cloned().unwrap_or_default(),
            order_id,
        });
    }
    Ok(axum::Json(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn require_customer_accepts_plain_ids() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CUSTOMER_ID_HEADER,
            HeaderValue::from_static("c-7f3a2b1c_9"),
        );
        assert_eq!(require_customer(&headers).unwrap(), "c-7f3a2b1c_9");
    }

    #[test]
    fn require_customer_rejects_missing_or_malformed() {
        let headers = HeaderMap::new();
        assert!(require_customer(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(CUSTOMER_ID_HEADER, HeaderValue::from_static("a b"));
        assert!(require_customer(&headers).is_err());

        let long = "x".repeat(65);
        let mut headers = HeaderMap::new();
        headers.insert(CUSTOMER_ID_HEADER, HeaderValue::from_str(&long).unwrap());
        assert!(require_customer(&headers).is_err());
    }

    #[test]
    fn client_ip_takes_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.7");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "127.0.0.1");
    }
}
