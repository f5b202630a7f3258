use nanoid::nanoid;
use serde::{Deserialize, Deserializer, Serialize};

/// Generate a 12-character nanoid for handles minted locally
pub fn generate_id() -> String {
    nanoid!(12)
}

macro_rules! string_id {
    (@plain $(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
    ($(#[$meta:meta])* $name:ident) => {
        string_id!(@plain $(#[$meta])* $name);

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer).map(Self)
            }
        }
    };
}

string_id! {
    /// Opaque relay connection handle (the socket id of a participant).
    ///
    /// Ordered so that glare between two offers can be settled by comparing
    /// the two handles.
    ConnectionId
}

string_id! {
    @plain
    /// Room name supplied by the joining participant; clients may send it
    /// as a JSON string or an integer
    RoomId
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Name(name) => Self(name),
            Raw::Unsigned(n) => Self(n.to_string()),
            Raw::Signed(n) => Self(n.to_string()),
        })
    }
}

string_id! {
    /// Media stream identifier
    StreamId
}

string_id! {
    /// Media track identifier
    TrackId
}

impl StreamId {
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }
}
