//! Payment Bridge: builds the signed gateway redirect and authenticates the
//! asynchronous return callback.
//!
//! The gateway verifies HMAC-SHA512 over the lexicographically sorted,
//! form-encoded query string, so parameter order and encoding here are a wire
//! requirement: the encoder below reproduces Java URLEncoder output
//! (unreserved `A-Z a-z 0-9 . - * _` kept, space as `+`, every other byte as
//! uppercase `%XX`), which is what the gateway signs against.

use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

type HmacSha512 = Hmac<Sha512>;

/// Recorded as the payment method on settled transactions.
pub const GATEWAY_METHOD: &str = "vnpay";
pub const SUCCESS_RESPONSE_CODE: &str = "00";

const PARAM_HASH: &str = "vnp_SecureHash";
const PARAM_HASH_TYPE: &str = "vnp_SecureHashType";
const PARAM_TXN_REF: &str = "vnp_TxnRef";
const PARAM_RESPONSE_CODE: &str = "vnp_ResponseCode";
const PARAM_AMOUNT: &str = "vnp_Amount";
const PARAM_TXN_NO: &str = "vnp_TransactionNo";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base_url: String,
    pub merchant_code: String,
    pub hash_secret: String,
    pub return_url: String,
    pub locale: String,
}

#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub order_ref: String,
    pub response_code: String,
    pub success: bool,
    /// Whole currency units (the wire carries the amount scaled by 100).
    pub amount: i64,
    pub gateway_txn_no: Option<String>,
}

pub fn form_encode(raw: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'*' | b'_' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            }
        }
    }
    out
}

fn hmac_sha512_hex(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sorted + encoded query string. Empty values are dropped (the gateway does
/// not sign them). This exact byte string is both the redirect query and the
/// signature payload.
fn canonical_query(params: &[(String, String)]) -> String {
    let mut pairs: Vec<&(String, String)> =
        params.iter().filter(|(_, v)| !v.is_empty()).collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", form_encode(k), form_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn build_redirect(
    cfg: &GatewayConfig,
    order_id: &str,
    amount: i64,
    client_ip: &str,
    now: DateTime<Utc>,
) -> String {
    let params: Vec<(String, String)> = vec![
        ("vnp_Version".to_string(), "2.1.0".to_string()),
        ("vnp_Command".to_string(), "pay".to_string()),
        ("vnp_TmnCode".to_string(), cfg.merchant_code.clone()),
        ("vnp_Locale".to_string(), cfg.locale.clone()),
        ("vnp_CurrCode".to_string(), "VND".to_string()),
        (PARAM_TXN_REF.to_string(), order_id.to_string()),
        (
            "vnp_OrderInfo".to_string(),
            format!("Payment for order {order_id}"),
        ),
        ("vnp_OrderType".to_string(), "other".to_string()),
        (PARAM_AMOUNT.to_string(), (amount * 100).to_string()),
        ("vnp_ReturnUrl".to_string(), cfg.return_url.clone()),
        ("vnp_IpAddr".to_string(), client_ip.to_string()),
        (
            "vnp_CreateDate".to_string(),
            now.format("%Y%m%d%H%M%S").to_string(),
        ),
    ];
    let query = canonical_query(&params);
    let hash = hmac_sha512_hex(&cfg.hash_secret, &query);
    format!("{}?{}&{}={}", cfg.base_url, query, PARAM_HASH, hash)
}

/// Authenticates and interprets a return callback. The signature is checked
/// first, in constant time, before any other field is looked at; a missing or
/// wrong signature is a hard rejection, never a payment failure.
pub fn verify_callback(
    cfg: &GatewayConfig,
    params: &HashMap<String, String>,
) -> ApiResult<CallbackOutcome> {
    let provided = params
        .get(PARAM_HASH)
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing gateway signature"))?;

    let pairs: Vec<(String, String)> = params
        .iter()
        .filter(|(k, _)| k.as_str() != PARAM_HASH && k.as_str() != PARAM_HASH_TYPE)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let payload = canonical_query(&pairs);
    let expected = hmac_sha512_hex(&cfg.hash_secret, &payload);
    if expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
        return Err(ApiError::unauthorized("invalid gateway signature"));
    }

    let order_ref = params
        .get(PARAM_TXN_REF)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing order reference"))?
        .to_string();
    let response_code = params
        .get(PARAM_RESPONSE_CODE)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing response code"))?
        .to_string();
    let raw_amount: i64 = params
        .get(PARAM_AMOUNT)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing amount"))?
        .parse()
        .map_err(|_| ApiError::bad_request("invalid amount"))?;
    if raw_amount < 0 {
        return Err(ApiError::bad_request("invalid amount"));
    }
    let gateway_txn_no = params
        .get(PARAM_TXN_NO)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let success = response_code == SUCCESS_RESPONSE_CODE;
    Ok(CallbackOutcome {
        order_ref,
        success,
        response_code,
        amount: raw_amount / 100,
        gateway_txn_no,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_cfg() -> GatewayConfig {
        GatewayConfig {
            base_url: "https://pay.example/gateway".to_string(),
            merchant_code: "VEXE0001".to_string(),
            hash_secret: "gateway-hash-secret-test".to_string(),
            return_url: "https://vexe.example/payments/return".to_string(),
            locale: "vn".to_string(),
        }
    }

    fn sign_map(cfg: &GatewayConfig, params: &mut HashMap<String, String>) {
        let pairs: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| k.as_str() != PARAM_HASH && k.as_str() != PARAM_HASH_TYPE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let payload = canonical_query(&pairs);
        params.insert(
            PARAM_HASH.to_string(),
            hmac_sha512_hex(&cfg.hash_secret, &payload),
        );
    }

    fn success_callback(cfg: &GatewayConfig) -> HashMap<String, String> {
        let mut params: HashMap<String, String> = HashMap::new();
        params.insert(PARAM_TXN_REF.to_string(), "O1".to_string());
        params.insert(PARAM_RESPONSE_CODE.to_string(), "00".to_string());
        params.insert(PARAM_AMOUNT.to_string(), "55000000".to_string());
        params.insert(PARAM_TXN_NO.to_string(), "14422574".to_string());
        params.insert("vnp_TmnCode".to_string(), cfg.merchant_code.clone());
        sign_map(cfg, &mut params);
        params
    }

    #[test]
    fn form_encode_matches_wire_substitutions() {
        assert_eq!(form_encode("10:30"), "10%3A30");
        assert_eq!(form_encode("a b"), "a+b");
        assert_eq!(form_encode("a/b"), "a%2Fb");
        assert_eq!(form_encode("AZaz09.-*_"), "AZaz09.-*_");
        assert_eq!(form_encode("é"), "%C3%A9");
    }

    #[test]
    fn redirect_query_is_sorted_and_scaled() {
        let cfg = test_cfg();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        let url = build_redirect(&cfg, "O1", 550_000, "203.0.113.7", now);

        let query = url.split_once('?').map(|(_, q)| q).unwrap();
        // vnp_Amount sorts first; the amount is in hundredths.
        assert!(query.starts_with("vnp_Amount=55000000&"));
        assert!(query.contains("vnp_CreateDate=20260301083000"));
        assert!(query.contains("vnp_TxnRef=O1"));

        // The signed portion (everything before the appended hash) is sorted.
        let signed = query.split_once("&vnp_SecureHash=").map(|(q, _)| q).unwrap();
        let names: Vec<&str> = signed
            .split('&')
            .map(|kv| kv.split_once('=').map(|(k, _)| k).unwrap_or(kv))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn redirect_signature_round_trips() {
        let cfg = test_cfg();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        let url = build_redirect(&cfg, "O1", 550_000, "203.0.113.7", now);

        let (rest, hash) = url.split_once("&vnp_SecureHash=").unwrap();
        let payload = rest.split_once('?').map(|(_, q)| q).unwrap();
        assert_eq!(hash, hmac_sha512_hex(&cfg.hash_secret, payload));
    }

    #[test]
    fn callback_success_is_interpreted_and_descaled() {
        let cfg = test_cfg();
        let params = success_callback(&cfg);

        let out = verify_callback(&cfg, &params).expect("verify");
        assert!(out.success);
        assert_eq!(out.order_ref, "O1");
        assert_eq!(out.amount, 550_000);
        assert_eq!(out.gateway_txn_no.as_deref(), Some("14422574"));
    }

    #[test]
    fn callback_failure_code_is_not_success() {
        let cfg = test_cfg();
        let mut params = success_callback(&cfg);
        params.insert(PARAM_RESPONSE_CODE.to_string(), "24".to_string());
        sign_map(&cfg, &mut params);

        let out = verify_callback(&cfg, &params).expect("verify");
        assert!(!out.success);
        assert_eq!(out.response_code, "24");
    }

    #[test]
    fn callback_missing_signature_is_rejected() {
        let cfg = test_cfg();
        let mut params = success_callback(&cfg);
        params.remove(PARAM_HASH);

        let err = verify_callback(&cfg, &params).expect_err("must reject");
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn callback_tampered_field_is_rejected_before_interpretation() {
        let cfg = test_cfg();
        let mut params = success_callback(&cfg);
        params.insert(PARAM_AMOUNT.to_string(), "1".to_string());

        let err = verify_callback(&cfg, &params).expect_err("must reject");
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn callback_with_valid_signature_but_bad_amount_is_malformed() {
        let cfg = test_cfg();
        let mut params = success_callback(&cfg);
        params.insert(PARAM_AMOUNT.to_string(), "not-a-number".to_string());
        sign_map(&cfg, &mut params);

        let err = verify_callback(&cfg, &params).expect_err("must reject");
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn hash_type_param_is_excluded_from_the_payload() {
        let cfg = test_cfg();
        let mut params = success_callback(&cfg);
        params.insert(PARAM_HASH_TYPE.to_string(), "HmacSHA512".to_string());

        let out = verify_callback(&cfg, &params).expect("verify");
        assert!(out.success);
    }
}
