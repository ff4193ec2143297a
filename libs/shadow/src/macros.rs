//! Macros for defining shadow document types.

/// Macro to define a typed shadow document.
///
/// This generates a newtype wrapper around a JSON object with:
/// - transparent `Serialize` and `Deserialize`
/// - `new()`, `from_value()`, `into_inner()` and `as_map()`
/// - `Deref` to the underlying map for read access
/// - `From<Map>` and `TryFrom<Value>` conversions
///
/// # Example
///
/// ```ignore
/// define_document!(Report, "State reported by the device.");
///
/// let report = Report::from_value(serde_json::json!({"cpu": 4}))?;
/// assert_eq!(report["cpu"], 4);
/// ```
#[macro_export]
macro_rules! define_document {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Default, PartialEq, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(::serde_json::Map<String, ::serde_json::Value>);

        impl $name {
            /// Creates an empty document.
            #[must_use]
            pub fn new() -> Self {
                Self(::serde_json::Map::new())
            }

            /// Builds a document from a JSON value, which must be an object.
            ///
            /// `null` is accepted as the empty document.
            pub fn from_value(value: ::serde_json::Value) -> Result<Self, $crate::ShadowError> {
                match value {
                    ::serde_json::Value::Object(map) => Ok(Self(map)),
                    ::serde_json::Value::Null => Ok(Self::new()),
                    ::serde_json::Value::Bool(_) => Err($crate::ShadowError::NotAnObject("a boolean")),
                    ::serde_json::Value::Number(_) => Err($crate::ShadowError::NotAnObject("a number")),
                    ::serde_json::Value::String(_) => Err($crate::ShadowError::NotAnObject("a string")),
                    ::serde_json::Value::Array(_) => Err($crate::ShadowError::NotAnObject("an array")),
                }
            }

            /// Returns the document as a JSON value.
            #[must_use]
            pub fn to_value(&self) -> ::serde_json::Value {
                ::serde_json::Value::Object(self.0.clone())
            }

            /// Returns the underlying map.
            #[must_use]
            pub fn as_map(&self) -> &::serde_json::Map<String, ::serde_json::Value> {
                &self.0
            }

            /// Consumes the document, returning the underlying map.
            #[must_use]
            pub fn into_inner(self) -> ::serde_json::Map<String, ::serde_json::Value> {
                self.0
            }

            /// Sets a top-level key.
            pub fn insert(&mut self, key: impl Into<String>, value: ::serde_json::Value) {
                self.0.insert(key.into(), value);
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = ::serde_json::Map<String, ::serde_json::Value>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<::serde_json::Map<String, ::serde_json::Value>> for $name {
            fn from(map: ::serde_json::Map<String, ::serde_json::Value>) -> Self {
                Self(map)
            }
        }

        impl TryFrom<::serde_json::Value> for $name {
            type Error = $crate::ShadowError;

            fn try_from(value: ::serde_json::Value) -> Result<Self, Self::Error> {
                Self::from_value(value)
            }
        }

        impl From<$name> for ::serde_json::Value {
            fn from(doc: $name) -> Self {
                ::serde_json::Value::Object(doc.0)
            }
        }
    };
}
