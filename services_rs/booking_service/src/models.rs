use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub env: String,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct BookingReq {
    pub trip_id: String,
    pub seat_codes: Vec<String>,
    pub pickup_point_id: String,
    pub dropoff_point_id: String,
    pub coupon_id: Option<String>,
    /// Client-side total, checked against the server-computed amount.
    pub expected_total: Option<i64>,
}

#[derive(Debug, Serialize, Clone)]
pub struct TicketBrief {
    pub id: String,
    pub code: String,
    pub seat_code: String,
    pub status: String,
    pub qr_payload: String,
}

#[derive(Debug, Serialize)]
pub struct BookingOut {
    pub order_id: String,
    pub status: String,
    pub origin_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub currency: String,
    pub tickets: Vec<TicketBrief>,
    pub payment_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CouponPreviewReq {
    pub coupon_id: String,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct CouponPreviewOut {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LookupParams {
    pub email: String,
    pub phone: String,
    pub code: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct TripOut {
    pub id: String,
    pub label: String,
    pub depart_at: Option<DateTime<Utc>>,
    pub arrive_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StopPointOut {
    pub id: String,
    pub name: String,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct OrderSummaryOut {
    pub id: String,
    pub status: String,
    pub origin_amount: i64,
    pub final_amount: i64,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TransactionOut {
    pub id: String,
    pub amount: i64,
    pub method: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CouponSummaryOut {
    pub id: String,
    pub code: String,
    pub discount_type: String,
    pub discount_value: i64,
}

#[derive(Debug, Serialize)]
pub struct TicketDetailOut {
    pub code: String,
    pub seat_code: String,
    pub status: String,
    pub qr_payload: String,
    pub purchased_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub holder_name: String,
    pub trip: TripOut,
    pub pickup: Option<StopPointOut>,
    pub dropoff: Option<StopPointOut>,
    pub order: OrderSummaryOut,
    pub transaction: Option<TransactionOut>,
    pub coupon: Option<CouponSummaryOut>,
}

#[derive(Debug, Deserialize)]
pub struct MyTicketsParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MyTicketOut {
    pub code: String,
    pub seat_code: String,
    pub status: String,
    pub purchased_at: Option<DateTime<Utc>>,
    pub trip: Option<TripOut>,
    pub order_id: String,
    pub order_status: String,
}

#[derive(Debug, Serialize)]
pub struct AbandonOut {
    pub order_id: String,
    pub status: String,
    pub changed: bool,
}
