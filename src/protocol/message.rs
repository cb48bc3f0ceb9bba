use serde::{Deserialize, Serialize};

/// Generic parameter value carried on the wire: null, booleans, integers,
/// floats, text, byte strings, arrays, and maps.
pub use serde_cbor::Value;

/// One logical message of the sync protocol.
///
/// Encodes as a CBOR map with a `kind` tag so peers can dispatch without
/// knowing the concrete parameter types ahead of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    /// Current or updated value for a shared name (server to observer).
    Value { name: String, value: Value },

    /// The name is no longer shared; observers must discard any cached
    /// value (server to observer).
    Lost { name: String },

    /// Request to write a value into the object behind a name (observer
    /// to server).
    Set { name: String, value: Value },
}

impl Message {
    pub fn value(name: impl Into<String>, value: Value) -> Self {
        Self::Value {
            name: name.into(),
            value,
        }
    }

    pub fn lost(name: impl Into<String>) -> Self {
        Self::Lost { name: name.into() }
    }

    pub fn set(name: impl Into<String>, value: Value) -> Self {
        Self::Set {
            name: name.into(),
            value,
        }
    }

    /// Shared name this message refers to.
    pub fn name(&self) -> &str {
        match self {
            Self::Value { name, .. } | Self::Lost { name } | Self::Set { name, .. } => name,
        }
    }
}
