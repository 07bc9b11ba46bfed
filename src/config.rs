//! Configuración central de la aplicación.
//! Carga variables de entorno (.env) y expone una estructura inmutable
//! (`CONFIG`):
//! - `engine`: `EngineConfig::from_env()` (variables `FLOW_*`).
//! - `FLOWMESH_DEMO_VALUES`: enteros separados por coma para la demo.
//! - `FLOWMESH_RUN_PG_DEMO=1`: habilita la demo de restauración sobre
//!   Postgres (requiere `DATABASE_URL`).

use std::env;

use flow_core::EngineConfig;
use once_cell::sync::Lazy;

use crate::errors::AppError;

const DEFAULT_DEMO_VALUES: [i64; 3] = [3, 4, 5];

pub struct AppConfig {
    pub engine: EngineConfig,
    pub demo_values: Vec<i64>,
    pub run_pg_demo: bool,
}

/// Instancia global perezosa de configuración, evaluada una sola vez.
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

/// Interpreta `"1, 2,3"` como `[1, 2, 3]`.
pub fn parse_values(raw: &str) -> Result<Vec<i64>, AppError> {
    raw.split(',')
       .map(str::trim)
       .filter(|s| !s.is_empty())
       .map(|s| s.parse::<i64>().map_err(|e| AppError::Config(format!("valor inválido '{s}': {e}"))))
       .collect()
}

impl AppConfig {
    pub fn from_env() -> Self {
        // carga .env
        let engine = EngineConfig::from_env();
        let demo_values = match env::var("FLOWMESH_DEMO_VALUES") {
            Ok(raw) => parse_values(&raw).unwrap_or_else(|e| {
                                             log::warn!("config: {e}; usando valores por defecto");
                                             DEFAULT_DEMO_VALUES.to_vec()
                                         }),
            Err(_) => DEFAULT_DEMO_VALUES.to_vec(),
        };
        let run_pg_demo = env::var("FLOWMESH_RUN_PG_DEMO").map(|v| v == "1").unwrap_or(false);
        Self { engine,
               demo_values,
               run_pg_demo }
    }
}
