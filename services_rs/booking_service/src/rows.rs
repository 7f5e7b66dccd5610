use crate::error::ApiError;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_db_dt(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ApiError::internal("database error"));
    }
    let s = s.replace('Z', "+00:00");
    let parsed =
        DateTime::parse_from_rfc3339(&s).map_err(|_| ApiError::internal("database error"))?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn row_dt_opt(row: &PgRow, col: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<String>, _>(col)
        .ok()
        .flatten()
        .and_then(|s| parse_db_dt(&s).ok())
}

pub fn normalize_limit(raw: Option<i64>, default: i64, min: i64, max: i64) -> i64 {
    raw.unwrap_or(default).clamp(min, max)
}

pub fn make_in_clause(start_index: usize, n: usize) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(n);
    for i in 0..n {
        parts.push(format!("${}", start_index + i));
    }
    format!("({})", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_db_dt_accepts_z_suffix() {
        let dt = parse_db_dt("2026-03-01T08:30:00Z").expect("parse");
        assert_eq!(dt.to_rfc3339(), "2026-03-01T08:30:00+00:00");
    }

    #[test]
    fn parse_db_dt_rejects_garbage() {
        assert!(parse_db_dt("").is_err());
        assert!(parse_db_dt("yesterday").is_err());
    }

    #[test]
    fn normalize_limit_clamps() {
        assert_eq!(normalize_limit(None, 20, 1, 100), 20);
        assert_eq!(normalize_limit(Some(0), 20, 1, 100), 1);
        assert_eq!(normalize_limit(Some(10_000), 20, 1, 100), 100);
    }

    #[test]
    fn in_clause_numbers_placeholders() {
        assert_eq!(make_in_clause(2, 3), "($2,$3,$4)");
    }
}
