//! Shared data models exchanged over the control channel

mod capture;
mod config;
mod session;
mod spoof;
mod status;
mod timestamp;
mod transfer;

pub use capture::*;
pub use config::*;
pub use session::*;
pub use spoof::*;
pub use status::*;
pub use timestamp::*;
pub use transfer::*;

/// Serde adapter rendering byte payloads as lowercase hex strings
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: From<Vec<u8>>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim())
            .map(T::from)
            .map_err(serde::de::Error::custom)
    }
}
