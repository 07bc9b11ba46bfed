//! flowmesh
//!
//! Fachada de la librería:
//! - Reexporta `flow_core` (orquestador, sesiones, checkpoints) y
//!   `flow_persistence` (store Postgres).
//! - `config`: configuración de la aplicación cargada desde `.env`.
//! - `errors`: error de nivel aplicación.
//! - `demo`: protocolo de ejemplo usado por el binario `flowmesh-demo`.

pub mod config;
pub mod demo;
pub mod errors;

pub use errors::AppError;
pub use flow_core as core;
pub use flow_persistence as persistence;
