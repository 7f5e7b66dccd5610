use crate::gateway::GatewayConfig;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub db_schema: Option<String>,
    pub ticket_secret: String,
    pub env_name: String,
    pub gateway: Option<GatewayConfig>,
    pub result_page_url: Option<String>,
}

impl AppState {
    pub fn table(&self, name: &str) -> String {
        match &self.db_schema {
            Some(s) => format!("{s}.{name}"),
            None => name.to_string(),
        }
    }
}
