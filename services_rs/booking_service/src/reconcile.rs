//! Reconciliation State Machine: the only writer of order/ticket/transaction
//! state after booking. Every transition runs under a `FOR UPDATE` lock on
//! the order row and is a no-op once the order is terminal, which makes
//! gateway retries and duplicate callbacks safe.

use crate::coupons;
use crate::error::{ApiError, ApiResult};
use crate::gateway::{CallbackOutcome, GATEWAY_METHOD};
use crate::rows::now_iso;
use crate::state::AppState;
use sqlx::{Row, Transaction};
use uuid::Uuid;

pub const ORDER_PENDING: &str = "pending";
pub const ORDER_COMPLETED: &str = "completed";
pub const ORDER_FAILED: &str = "failed";

#[derive(Debug)]
pub struct SettleOutcome {
    pub order_id: String,
    pub status: String,
    pub changed: bool,
}

/// Orders only ever move pending -> completed | failed. Anything else
/// (terminal or unrecognized) must not be touched.
fn transition_for(current: &str, success: bool) -> Option<&'static str> {
    match current {
        ORDER_PENDING => Some(if success { ORDER_COMPLETED } else { ORDER_FAILED }),
        _ => None,
    }
}

struct LockedOrder {
    id: String,
    customer_id: String,
    coupon_id: Option<String>,
    final_amount: i64,
    status: String,
}

async fn lock_order(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    order_id: &str,
) -> ApiResult<Option<LockedOrder>> {
    let orders = state.table("orders");
    let sql = format!(
        "SELECT id,customer_id,coupon_id,final_amount,status FROM {orders} WHERE id=$1 FOR UPDATE"
    );
    let Some(row) = sqlx::query(&sql)
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db order lock failed");
            ApiError::internal("database error")
        })?
    else {
        return Ok(None);
    };
    Ok(Some(LockedOrder {
        id: row.try_get("id").unwrap_or_default(),
        customer_id: row.try_get("customer_id").unwrap_or_default(),
        coupon_id: row.try_get("coupon_id").unwrap_or(None),
        final_amount: row.try_get("final_amount").unwrap_or(0),
        status: row
            .try_get("status")
            .unwrap_or_else(|_| ORDER_PENDING.to_string()),
    }))
}

async fn set_order_status(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    order_id: &str,
    status: &str,
) -> ApiResult<()> {
    let orders = state.table("orders");
    sqlx::query(&format!("UPDATE {orders} SET status=$1 WHERE id=$2"))
        .bind(status)
        .bind(order_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db order status update failed");
            ApiError::internal("database error")
        })?;
    Ok(())
}

async fn flip_pending_tickets(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    state: &AppState,
    order_id: &str,
    status: &str,
) -> ApiResult<()> {
    let tickets = state.table("tickets");
    sqlx::query(&format!(
        "UPDATE {tickets} SET status=$1 WHERE order_id=$2 AND status='pending'"
    ))
    .bind(status)
    .bind(order_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db ticket status update failed");
        ApiError::internal("database error")
    })?;
    Ok(())
}

pub async fn settle(state: &AppState, outcome: &CallbackOutcome) -> ApiResult<SettleOutcome> {
    if outcome.success {
        settle_success(
            state,
            &outcome.order_ref,
            outcome.amount,
            outcome.gateway_txn_no.as_deref(),
        )
        .await
    } else {
        settle_failure(state, &outcome.order_ref).await
    }
}

pub async fn settle_success(
    state: &AppState,
    order_ref: &str,
    amount: i64,
    gateway_txn_no: Option<&str>,
) -> ApiResult<SettleOutcome> {
    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let order = lock_order(&mut tx, state, order_ref)
        .await?
        .ok_or_else(|| ApiError::not_found("order not found"))?;

    let Some(next) = transition_for(&order.status, true) else {
        tx.rollback().await.ok();
        return Ok(SettleOutcome {
            order_id: order.id,
            status: order.status,
            changed: false,
        });
    };

    // The signature already proved gateway origin; a different amount means a
    // malformed or replayed message, so nothing is mutated.
    if amount != order.final_amount {
        tracing::error!(
            order_id = %order.id,
            callback_amount = amount,
            final_amount = order.final_amount,
            "callback amount mismatch"
        );
        return Err(ApiError::bad_request("callback amount mismatch"));
    }

    set_order_status(&mut tx, state, &order.id, next).await?;
    flip_pending_tickets(&mut tx, state, &order.id, "valid").await?;

    let transactions = state.table("transactions");
    sqlx::query(&format!(
        "INSERT INTO {transactions} (id,order_id,amount,method,status,gateway_txn_no,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&order.id)
    .bind(order.final_amount)
    .bind(GATEWAY_METHOD)
    .bind("completed")
    .bind(gateway_txn_no)
    .bind(now_iso())
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db transaction insert failed");
        ApiError::internal("database error")
    })?;

    if let Some(coupon_id) = order.coupon_id.as_deref() {
        coupons::record_usage(&mut tx, state, &order.customer_id, coupon_id, &order.id).await?;
    }

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    tracing::info!(order_id = %order.id, "order settled as completed");
    Ok(SettleOutcome {
        order_id: order.id,
        status: next.to_string(),
        changed: true,
    })
}

pub async fn settle_failure(state: &AppState, order_ref: &str) -> ApiResult<SettleOutcome> {
    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let order = lock_order(&mut tx, state, order_ref)
        .await?
        .ok_or_else(|| ApiError::not_found("order not found"))?;

    let Some(next) = transition_for(&order.status, false) else {
        tx.rollback().await.ok();
        return Ok(SettleOutcome {
            order_id: order.id,
            status: order.status,
            changed: false,
        });
    };

    set_order_status(&mut tx, state, &order.id, next).await?;
    flip_pending_tickets(&mut tx, state, &order.id, "cancelled").await?;
    coupons::reverse_usage(
        &mut tx,
        state,
        &order.id,
        &order.customer_id,
        order.coupon_id.as_deref(),
    )
    .await?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    tracing::info!(order_id = %order.id, "order settled as failed");
    Ok(SettleOutcome {
        order_id: order.id,
        status: next.to_string(),
        changed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_orders_transition_by_outcome() {
        assert_eq!(transition_for("pending", true), Some("completed"));
        assert_eq!(transition_for("pending", false), Some("failed"));
    }

    #[test]
    fn terminal_orders_are_never_touched() {
        assert_eq!(transition_for("completed", true), None);
        assert_eq!(transition_for("completed", false), None);
        assert_eq!(transition_for("failed", true), None);
        assert_eq!(transition_for("failed", false), None);
    }

    #[test]
    fn unrecognized_states_are_left_alone() {
        assert_eq!(transition_for("refunding", true), None);
        assert_eq!(transition_for("", false), None);
    }
}
