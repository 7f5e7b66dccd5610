//! Coupon Ledger: the only place coupon usage counters and usage rows change.
//!
//! `apply` reserves a usage slot at booking time (optimistic, inside the
//! booking transaction); `record_usage` makes the consumption permanent after
//! a successful settlement; `reverse_usage` gives the slot back when the
//! order fails. All entry points (booking, reconciliation, preview) delegate
//! here instead of re-implementing the checks.

use crate::error::{ApiError, ApiResult};
use crate::rows::{now_iso, parse_db_dt};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use sqlx::{Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponRejection {
    NotFound,
    Expired,
    LimitReached,
    AlreadyUsed,
}

impl CouponRejection {
    pub fn code(self) -> &'static str {
        match self {
            CouponRejection::NotFound => "COUPON_NOT_FOUND",
            CouponRejection::Expired => "COUPON_EXPIRED",
            CouponRejection::LimitReached => "COUPON_LIMIT_REACHED",
            CouponRejection::AlreadyUsed => "COUPON_ALREADY_USED",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            CouponRejection::NotFound => "coupon not found",
            CouponRejection::Expired => "coupon is outside its validity window",
            CouponRejection::LimitReached => "coupon usage limit reached",
            CouponRejection::AlreadyUsed => "coupon already used by this customer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountKind {
    Percent,
    Fixed,
}

impl DiscountKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "percent" => Some(DiscountKind::Percent),
            "fixed" => Some(DiscountKind::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CouponRow {
    pub id: String,
    pub code: String,
    pub kind: DiscountKind,
    pub value: i64,
    pub max_discount: Option<i64>,
    pub max_uses: i32,
    pub used_count: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct AppliedCoupon {
    pub coupon_id: String,
    pub discount_amount: i64,
    pub final_amount: i64,
}

/// Percent: round to the nearest whole currency unit, then cap. Fixed: clamp
/// to the order amount. Never negative, never more than the original.
pub fn compute_discount(
    kind: DiscountKind,
    value: i64,
    max_discount: Option<i64>,
    original: i64,
) -> i64 {
    if original <= 0 || value <= 0 {
        return 0;
    }
    let raw = match kind {
        DiscountKind::Percent => {
            let pct = (original as i128 * value as i128 + 50) / 100;
            let pct = pct.min(original as i128) as i64;
            match max_discount {
                Some(cap) if cap >= 0 => pct.min(cap),
                _ => pct,
            }
        }
        DiscountKind::Fixed => value,
    };
    raw.clamp(0, original)
}

async fn load_coupon(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    coupon_id: &str,
) -> ApiResult<Option<CouponRow>> {
    let coupons = state.table("coupons");
    let sql = format!(
        "SELECT id,code,discount_type,discount_value,max_discount,max_uses,used_count,\
         valid_from,valid_to,status FROM {coupons} WHERE id=$1"
    );
    let Some(row) = sqlx::query(&sql)
        .bind(coupon_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db coupon lookup failed");
            ApiError::internal("database error")
        })?
    else {
        return Ok(None);
    };

    let raw_kind: String = row.try_get("discount_type").unwrap_or_default();
    let Some(kind) = DiscountKind::parse(&raw_kind) else {
        tracing::error!(coupon_id = %coupon_id, discount_type = %raw_kind, "unknown coupon discount type");
        return Err(ApiError::internal("invalid coupon configuration"));
    };

    let valid_from = row
        .try_get::<Option<String>, _>("valid_from")
        .ok()
        .flatten()
        .and_then(|s| parse_db_dt(&s).ok());
    let valid_to = row
        .try_get::<Option<String>, _>("valid_to")
        .ok()
        .flatten()
        .and_then(|s| parse_db_dt(&s).ok());
    let status: String = row
        .try_get("status")
        .unwrap_or_else(|_| "inactive".to_string());

    Ok(Some(CouponRow {
        id: row.try_get("id").unwrap_or_default(),
        code: row.try_get("code").unwrap_or_default(),
        kind,
        value: row.try_get("discount_value").unwrap_or(0),
        max_discount: row.try_get("max_discount").unwrap_or(None),
        max_uses: row.try_get("max_uses").unwrap_or(0),
        used_count: row.try_get("used_count").unwrap_or(0),
        valid_from,
        valid_to,
        active: status == "active",
    }))
}

async fn has_active_usage(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    coupon_id: &str,
    customer_id: &str,
) -> ApiResult<bool> {
    let usages = state.table("coupon_usages");
    let sql = format!(
        "SELECT 1 FROM {usages} WHERE coupon_id=$1 AND customer_id=$2 AND is_active=1 LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(coupon_id)
        .bind(customer_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db coupon usage lookup failed");
            ApiError::internal("database error")
        })?;
    Ok(row.is_some())
}

/// Read-only checks; no side effects. An inactive coupon reads as not-found
/// so disabled campaigns are indistinguishable from unknown ids.
pub async fn validate(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    coupon_id: &str,
    customer_id: &str,
    now: DateTime<Utc>,
) -> ApiResult<Result<CouponRow, CouponRejection>> {
    let Some(coupon) = load_coupon(tx, state, coupon_id).await? else {
        return Ok(Err(CouponRejection::NotFound));
    };
    if !coupon.active {
        return Ok(Err(CouponRejection::NotFound));
    }
    if coupon.valid_from.map(|from| now < from).unwrap_or(false)
        || coupon.valid_to.map(|to| now > to).unwrap_or(false)
    {
        return Ok(Err(CouponRejection::Expired));
    }
    // A customer who already consumed the coupon sees AlreadyUsed even when
    // the cap is also exhausted.
    if has_active_usage(tx, state, &coupon.id, customer_id).await? {
        return Ok(Err(CouponRejection::AlreadyUsed));
    }
    if coupon.used_count >= coupon.max_uses {
        return Ok(Err(CouponRejection::LimitReached));
    }
    Ok(Ok(coupon))
}

/// Re-validates and reserves a usage slot inside the caller's transaction.
/// The increment is a conditional update, not read-then-write: two concurrent
/// applies racing for the last slot cannot both succeed.
pub async fn apply(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    coupon_id: &str,
    customer_id: &str,
    original_amount: i64,
    now: DateTime<Utc>,
) -> ApiResult<Result<AppliedCoupon, CouponRejection>> {
    let coupon = match validate(tx, state, coupon_id, customer_id, now).await? {
        Ok(c) => c,
        Err(rej) => return Ok(Err(rej)),
    };

    let coupons = state.table("coupons");
    let sql = format!(
        "UPDATE {coupons} SET used_count = used_count + 1 WHERE id=$1 AND used_count < max_uses"
    );
    let updated = sqlx::query(&sql)
        .bind(&coupon.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db coupon slot reserve failed");
            ApiError::internal("database error")
        })?
        .rows_affected();
    if updated == 0 {
        return Ok(Err(CouponRejection::LimitReached));
    }

    let discount_amount =
        compute_discount(coupon.kind, coupon.value, coupon.max_discount, original_amount);
    Ok(Ok(AppliedCoupon {
        coupon_id: coupon.id,
        discount_amount,
        final_amount: original_amount - discount_amount,
    }))
}

/// Permanent usage record, written only after a successful settlement.
/// No-op when an active row for the order already exists.
pub async fn record_usage(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    customer_id: &str,
    coupon_id: &str,
    order_id: &str,
) -> ApiResult<()> {
    let usages = state.table("coupon_usages");
    let exists = sqlx::query(&format!(
        "SELECT 1 FROM {usages} WHERE order_id=$1 AND is_active=1 LIMIT 1"
    ))
    .bind(order_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db record_usage lookup failed");
        ApiError::internal("database error")
    })?
    .is_some();
    if exists {
        return Ok(());
    }

    sqlx::query(&format!(
        "INSERT INTO {usages} (id,customer_id,coupon_id,order_id,used_at,is_active) \
         VALUES ($1,$2,$3,$4,$5,1)"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(customer_id)
    .bind(coupon_id)
    .bind(order_id)
    .bind(now_iso())
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db record_usage insert failed");
        ApiError::internal("database error")
    })?;
    Ok(())
}

/// Gives the order's reserved slot back. Idempotent: the usage row (active or
/// not) is the durable marker that this order's reservation was accounted
/// for, so the decrement runs at most once per order. Orders without a coupon
/// are a no-op.
pub async fn reverse_usage(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    order_id: &str,
    customer_id: &str,
    coupon_id: Option<&str>,
) -> ApiResult<()> {
    let Some(coupon_id) = coupon_id.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let usages = state.table("coupon_usages");
    let coupons = state.table("coupons");

    let flipped = sqlx::query(&format!(
        "UPDATE {usages} SET is_active=0 WHERE order_id=$1 AND is_active=1"
    ))
    .bind(order_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db reverse_usage deactivate failed");
        ApiError::internal("database error")
    })?
    .rows_affected();

    if flipped == 0 {
        let already_marked = sqlx::query(&format!(
            "SELECT 1 FROM {usages} WHERE order_id=$1 LIMIT 1"
        ))
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db reverse_usage lookup failed");
            ApiError::internal("database error")
        })?
        .is_some();
        if already_marked {
            return Ok(());
        }
        // The order failed before record_usage ever ran; leave an inactive
        // marker so a second reversal cannot decrement again.
        sqlx::query(&format!(
            "INSERT INTO {usages} (id,customer_id,coupon_id,order_id,used_at,is_active) \
             VALUES ($1,$2,$3,$4,$5,0)"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(customer_id)
        .bind(coupon_id)
        .bind(order_id)
        .bind(now_iso())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db reverse_usage marker insert failed");
            ApiError::internal("database error")
        })?;
    }

    sqlx::query(&format!(
        "UPDATE {coupons} SET used_count = used_count - 1 WHERE id=$1 AND used_count > 0"
    ))
    .bind(coupon_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db reverse_usage decrement failed");
        ApiError::internal("database error")
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_discount_caps_at_max_discount() {
        let d = compute_discount(DiscountKind::Percent, 10, Some(50_000), 600_000);
        assert_eq!(d, 50_000);
        assert_eq!(600_000 - d, 550_000);
    }

    #[test]
    fn percent_discount_rounds_to_nearest_unit() {
        // 1% of 150 is 1.5, rounds up to 2.
        assert_eq!(compute_discount(DiscountKind::Percent, 1, None, 150), 2);
        // 1% of 149 is 1.49, rounds down to 1.
        assert_eq!(compute_discount(DiscountKind::Percent, 1, None, 149), 1);
    }

    #[test]
    fn percent_discount_without_cap_uses_full_percentage() {
        assert_eq!(
            compute_discount(DiscountKind::Percent, 25, None, 400_000),
            100_000
        );
    }

    #[test]
    fn percent_discount_never_exceeds_original() {
        assert_eq!(compute_discount(DiscountKind::Percent, 150, None, 1_000), 1_000);
    }

    #[test]
    fn fixed_discount_clamps_to_order_amount() {
        assert_eq!(compute_discount(DiscountKind::Fixed, 80_000, None, 50_000), 50_000);
        assert_eq!(compute_discount(DiscountKind::Fixed, 30_000, None, 50_000), 30_000);
    }

    #[test]
    fn degenerate_inputs_yield_zero() {
        assert_eq!(compute_discount(DiscountKind::Percent, 10, None, 0), 0);
        assert_eq!(compute_discount(DiscountKind::Fixed, 0, None, 50_000), 0);
        assert_eq!(compute_discount(DiscountKind::Percent, -5, None, 50_000), 0);
    }

    #[test]
    fn rejection_codes_are_stable() {
        assert_eq!(CouponRejection::NotFound.code(), "COUPON_NOT_FOUND");
        assert_eq!(CouponRejection::Expired.code(), "COUPON_EXPIRED");
        assert_eq!(CouponRejection::LimitReached.code(), "COUPON_LIMIT_REACHED");
        assert_eq!(CouponRejection::AlreadyUsed.code(), "COUPON_ALREADY_USED");
    }

    #[test]
    fn discount_kind_parses_known_values_only() {
        assert_eq!(DiscountKind::parse("percent"), Some(DiscountKind::Percent));
        assert_eq!(DiscountKind::parse(" Fixed "), Some(DiscountKind::Fixed));
        assert_eq!(DiscountKind::parse("bogo"), None);
    }
}
