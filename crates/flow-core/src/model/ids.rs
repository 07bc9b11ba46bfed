//! Identificadores fuertemente tipados (flows, sesiones, mensajes) y
//! direcciones de contraparte.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dirección/identidad de un nodo participante.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Party(pub String);

impl Party {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Genera un identificador aleatorio (v4).
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    /// Identidad única de una instancia de flow.
    FlowId
);
uuid_id!(
    /// Identificador local de una sesión (cada lado tiene el suyo).
    SessionId
);
uuid_id!(
    /// Identificador único de un mensaje en el transporte. Se mantiene
    /// estable al reenviar tras un reinicio.
    MessageId
);
