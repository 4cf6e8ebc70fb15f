//! Newtype domain identifiers.
//!
//! Every name that flows between the bus, the blob store and the status store
//! is wrapped in a distinct newtype. This prevents accidentally passing a
//! [`QueueName`] where a [`RoutingKey`] is expected even though both are
//! strings on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase recorded for, and stage name carried by, envelopes addressed to the
/// terminal graph-materialisation stage.
pub const TERMINAL_STAGE: &str = "builder";

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display, Borrow<str>.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifies one unit of work from pipeline entry to graph materialisation.
    ///
    /// Generated once by the entry point and propagated unchanged; it is the
    /// join key across bus messages, blob object names and status records.
    TaskId
}

impl TaskId {
    /// Generates a fresh random task identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

string_id! {
    /// Names a stage of the pipeline (e.g. `"crawler"`, `"parser"`).
    ///
    /// Stage names are the keys of the pipeline definition, the routing
    /// discriminator carried by each envelope, and the `phase` of a status record.
    StageName
}

impl StageName {
    /// The stage name used for the terminal builder hand-off.
    pub fn terminal() -> Self {
        Self(TERMINAL_STAGE.to_owned())
    }

    /// Returns `true` if this is the terminal marker.
    pub fn is_terminal(&self) -> bool {
        self.0 == TERMINAL_STAGE
    }
}

string_id! {
    /// Selects the built-in handler implementation for a stage.
    HandlerId
}

string_id! {
    /// Dot-delimited topic routing key (e.g. `"index.crawler"`).
    RoutingKey
}

string_id! {
    /// Name of a topic exchange on the message bus.
    ExchangeName
}

string_id! {
    /// Name of a durable queue on the message bus.
    QueueName
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identifiers_are_rejected() {
        assert!(StageName::new("").is_none());
        assert_eq!(StageName::new("parser").unwrap().as_str(), "parser");
    }

    #[test]
    fn generated_task_ids_are_distinct() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn terminal_marker_round_trips() {
        let terminal = StageName::terminal();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.to_string(), TERMINAL_STAGE);
        assert!(!StageName::new("chunker").unwrap().is_terminal());
    }

    #[test]
    fn identifiers_serialize_as_plain_strings() {
        let key = RoutingKey::new("index.parser").unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"index.parser\"");
    }
}
