use serde::{Deserialize, Serialize};

/// Información negociada de la contraparte: versión de protocolo y
/// aplicación que la ejecuta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowInfo {
    pub flow_version: u32,
    pub app_name: String,
}

/// Declaración de protocolo bajo la cual un routine inicia sesiones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolDecl {
    pub name: String,
    pub version: u32,
}

impl ProtocolDecl {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self { name: name.into(),
               version }
    }
}
