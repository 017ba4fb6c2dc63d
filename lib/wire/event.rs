use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single record on the wire-protocol event stream.
///
/// In structured mode every event is serialized as one newline-terminated
/// JSON record with a `type` discriminator. In human-readable mode only
/// events that carry a natural-language rendering are printed; see
/// [`WireEvent::user_message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireEvent {
    /// A lifecycle-phase transition.
    #[serde(rename = "state")]
    State {
        /// The phase or machine-state name.
        state: String,
    },

    /// A simple named notification.
    #[serde(rename = "notify")]
    Notify {
        /// The notification name.
        event: String,
    },

    /// A human-readable error derived from an underlying failure.
    #[serde(rename = "error")]
    Error {
        /// The error message.
        error: String,
    },

    /// A chunk of bytes observed on a tracked pipe.
    #[serde(rename = "data")]
    Data {
        /// The pipe tag the bytes came from.
        tag: String,

        /// The raw bytes, base64-encoded on the wire.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Progress of the OS-image installation routine, 0-100.
    #[serde(rename = "installation.progress")]
    InstallationProgress {
        /// Fraction complete as a percentage.
        progress: f64,
    },

    /// Progress of the restore-image download, 0-100.
    #[serde(rename = "installation.download.progress")]
    InstallationDownloadProgress {
        /// Fraction complete as a percentage.
        progress: f64,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WireEvent {
    /// Creates a lifecycle-phase event.
    pub fn state(state: impl Into<String>) -> Self {
        Self::State {
            state: state.into(),
        }
    }

    /// Creates a named notification event.
    pub fn notify(event: impl Into<String>) -> Self {
        Self::Notify {
            event: event.into(),
        }
    }

    /// Creates an error event from a failure.
    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }

    /// Creates a data-chunk event for a tracked pipe.
    pub fn data(tag: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            tag: tag.into(),
            data: data.into(),
        }
    }

    /// The natural-language rendering of the event, if it has one.
    ///
    /// Only error events and the two progress kinds render; everything
    /// else is suppressed in human-readable mode.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Error { error } => Some(format!("ERROR: {}", error)),
            Self::InstallationProgress { progress } => {
                Some(format!("Installation Progress: {}%", *progress as i64))
            }
            Self::InstallationDownloadProgress { progress } => {
                Some(format!("Installer Download Progress: {:.4}%", progress))
            }
            _ => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Modules: serde helpers
//--------------------------------------------------------------------------------------------------

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub(super) fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
