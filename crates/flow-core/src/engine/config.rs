//! Configuración del orquestador.
//! Valores por defecto en `constants`; `from_env` permite sobrescribirlos
//! (`.env` incluido) con:
//! - `FLOW_APP_NAME`
//! - `FLOW_MAX_WORKERS`
//! - `FLOW_DEDUP_CAPACITY`
//! - `FLOW_ACCEPTABLE_LIVE_ON_STOP`
//! - `FLOW_FINISHED_CAPACITY`
//! - `FLOW_ORPHAN_TIMEOUT_SECS`

use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::constants::{DEFAULT_APP_NAME, DEFAULT_DEDUP_CAPACITY, DEFAULT_FINISHED_CAPACITY, DEFAULT_MAX_WORKERS,
                       DEFAULT_ORPHAN_TIMEOUT_SECS};

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Identificador de aplicación anunciado a las contrapartes.
    pub app_name: String,
    /// Reanudaciones concurrentes como máximo.
    pub max_workers: usize,
    pub dedup_capacity: usize,
    /// Flows vivos tolerados al detener el orquestador.
    pub acceptable_live_on_stop: usize,
    /// Resultados de flows terminados que se conservan para `result_of`.
    pub finished_capacity: usize,
    /// Tiempo que una sesión huérfana espera su `SessionConfirm`.
    pub orphan_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { app_name: DEFAULT_APP_NAME.to_string(),
               max_workers: DEFAULT_MAX_WORKERS,
               dedup_capacity: DEFAULT_DEDUP_CAPACITY,
               acceptable_live_on_stop: 0,
               finished_capacity: DEFAULT_FINISHED_CAPACITY,
               orphan_timeout: Duration::from_secs(DEFAULT_ORPHAN_TIMEOUT_SECS) }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        let d = Self::default();
        Self { app_name: env::var("FLOW_APP_NAME").unwrap_or(d.app_name),
               max_workers: env_or("FLOW_MAX_WORKERS", d.max_workers).max(1),
               dedup_capacity: env_or("FLOW_DEDUP_CAPACITY", d.dedup_capacity),
               acceptable_live_on_stop: env_or("FLOW_ACCEPTABLE_LIVE_ON_STOP", d.acceptable_live_on_stop),
               finished_capacity: env_or("FLOW_FINISHED_CAPACITY", d.finished_capacity),
               orphan_timeout: Duration::from_secs(env_or("FLOW_ORPHAN_TIMEOUT_SECS", d.orphan_timeout.as_secs())) }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_acceptable_live_on_stop(mut self, n: usize) -> Self {
        self.acceptable_live_on_stop = n;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_finished_capacity(mut self, capacity: usize) -> Self {
        self.finished_capacity = capacity;
        self
    }

    pub fn with_orphan_timeout(mut self, timeout: Duration) -> Self {
        self.orphan_timeout = timeout;
        self
    }
}
