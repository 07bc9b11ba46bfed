//! Sesiones de flow y su máquina de estados de protocolo.

mod flow_session;
mod state;

pub use flow_session::FlowSession;
pub use state::{SessionEnd, SessionState};
