//! Payload etiquetado con su tipo.
//!
//! Cada valor enviado por una sesión viaja como `{type_name, value}`. El
//! receptor declara el tipo esperado y la etiqueta se compara antes de
//! decodificar: un payload de otro tipo se trata como fin inesperado de la
//! contraparte.
//!
//! La etiqueta sale de `PayloadType::type_tag`, un nombre explícito que no
//! depende del compilador: dos nodos compilados por separado (o un nodo
//! recompilado entre checkpoint y restore) deben coincidir en ella.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CodecError;

/// Tipo que puede viajar por una sesión.
///
/// Los tipos de la aplicación lo implementan con `payload_type!`:
///
/// ```ignore
/// flow_core::payload_type!(Amount => "money.Amount");
/// ```
pub trait PayloadType: Serialize + DeserializeOwned + 'static {
    fn type_tag() -> Cow<'static, str>;
}

/// Implementa `PayloadType` con una etiqueta fija.
#[macro_export]
macro_rules! payload_type {
    ($($ty:ty => $tag:expr),+ $(,)?) => {
        $(
            impl $crate::model::PayloadType for $ty {
                fn type_tag() -> ::std::borrow::Cow<'static, str> {
                    ::std::borrow::Cow::Borrowed($tag)
                }
            }
        )+
    };
}

payload_type!(() => "unit",
              bool => "bool",
              i32 => "i32",
              i64 => "i64",
              u32 => "u32",
              u64 => "u64",
              f64 => "f64",
              String => "String",
              Value => "json");

impl<T: PayloadType> PayloadType for Vec<T> {
    fn type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("List<{}>", T::type_tag()))
    }
}

impl<T: PayloadType> PayloadType for Option<T> {
    fn type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("Option<{}>", T::type_tag()))
    }
}

impl<T: PayloadType> PayloadType for BTreeMap<String, T> {
    fn type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("Map<{}>", T::type_tag()))
    }
}

impl<A: PayloadType, B: PayloadType> PayloadType for (A, B) {
    fn type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("({}, {})", A::type_tag(), B::type_tag()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub type_name: String,
    pub value: Value,
}

impl Payload {
    /// Serializa `value` y lo etiqueta con `T::type_tag()`.
    pub fn of<T: PayloadType>(value: &T) -> Result<Self, CodecError> {
        let value = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Self { type_name: T::type_tag().into_owned(),
                  value })
    }

    /// ¿La etiqueta coincide con el tipo esperado?
    pub fn is_a(&self, expected: &str) -> bool {
        self.type_name == expected
    }

    /// Decodifica verificando antes la etiqueta de tipo.
    pub fn decode<T: PayloadType>(&self) -> Result<T, CodecError> {
        let expected = T::type_tag();
        if !self.is_a(&expected) {
            return Err(CodecError::TypeMismatch { expected: expected.into_owned(),
                                                  found: self.type_name.clone() });
        }
        serde_json::from_value(self.value.clone()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Amount {
        cents: i64,
    }

    payload_type!(Amount => "money.Amount");

    #[test]
    fn decode_rejects_other_type_tag() {
        let p = Payload::of(&42i64).unwrap();
        assert_eq!(p.type_name, "i64");
        assert_eq!(p.decode::<i64>().unwrap(), 42);
        let err = p.decode::<String>().unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { ref found, .. } if found == "i64"));
    }

    #[test]
    fn tags_are_explicit_names_not_compiler_paths() {
        assert_eq!(String::type_tag(), "String");
        assert_eq!(Vec::<Option<u32>>::type_tag(), "List<Option<u32>>");
        assert_eq!(<(i64, String)>::type_tag(), "(i64, String)");

        let p = Payload::of(&Amount { cents: 150 }).unwrap();
        assert_eq!(p.type_name, "money.Amount");
        assert_eq!(p.decode::<Amount>().unwrap(), Amount { cents: 150 });
    }

    #[test]
    fn tag_from_another_build_decodes_when_names_match() {
        // Lo que importa es el texto de la etiqueta, no el tipo que lo produjo
        let wire = Payload { type_name: "String".into(),
                             value: Value::String("hello".into()) };
        assert_eq!(wire.decode::<String>().unwrap(), "hello");
    }
}
