const MIN_SECRET_LEN: usize = 16;

pub fn is_production_like(env_name: &str) -> bool {
    let env = env_name.trim().to_ascii_lowercase();
    matches!(env.as_str(), "prod" | "production" | "staging")
}

/// Rejects missing, short or placeholder-looking secrets in prod/staging.
/// Dev and test environments are left alone for local ergonomics.
pub fn enforce_value_policy_for_env(
    env_name: &str,
    key: &str,
    value: Option<&str>,
    required_in_prod: bool,
) -> Result<(), String> {
    if !is_production_like(env_name) {
        return Ok(());
    }

    let secret = value.map(str::trim).unwrap_or("");
    if secret.is_empty() {
        if required_in_prod {
            return Err(format!("{key} must be set in prod/staging"));
        }
        return Ok(());
    }

    if secret.len() < MIN_SECRET_LEN {
        return Err(format!(
            "{key} must be at least {MIN_SECRET_LEN} characters in prod/staging"
        ));
    }
    if looks_like_placeholder(secret) {
        return Err(format!(
            "{key} looks like a placeholder/default value; use a strong random secret"
        ));
    }
    Ok(())
}

fn looks_like_placeholder(secret: &str) -> bool {
    let s = secret.trim().to_ascii_lowercase();
    let banned_exact = [
        "secret", "password", "default", "dummy", "example", "test", "sample", "letmein",
    ];
    if banned_exact.contains(&s.as_str()) {
        return true;
    }
    let banned_fragments = [
        "change-me",
        "change_me",
        "changeme",
        "replace-me",
        "replace_me",
        "fix-me",
        "todo",
        "your-secret",
        "your_secret",
        "dev-secret",
        "dev_secret",
        "insecure",
    ];
    banned_fragments.iter().any(|v| s.contains(v))
}
