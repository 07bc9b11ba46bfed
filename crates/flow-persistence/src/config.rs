//! Configuración de conexión desde variables de entorno (`.env` incluido):
//! `DATABASE_URL` obligatorio, `DATABASE_MIN_CONNECTIONS` y
//! `DATABASE_MAX_CONNECTIONS` opcionales.

use std::env;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::error::PersistenceError;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

fn pool_size(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl DbConfig {
    pub fn from_env() -> Result<Self, PersistenceError> {
        Lazy::force(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL").map_err(|_| PersistenceError::Config("DATABASE_URL no definido".into()))?;
        Ok(Self { url,
                  min_connections: pool_size("DATABASE_MIN_CONNECTIONS", 2),
                  max_connections: pool_size("DATABASE_MAX_CONNECTIONS", 16) })
    }
}

/// Fuerza la carga temprana de `.env` desde aplicaciones externas.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}
