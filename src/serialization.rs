//! Byte-codec boundary for commits, snapshots and user payloads.
//!
//! Engines that persist to bytes take a [`SerializeCommits`] implementation
//! instead of committing to one format. [`JsonSerializer`] is the built-in
//! codec.

use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SerializationError;

/// Encodes values to a byte sink and decodes them back.
///
/// Implementations must round-trip polymorphic payloads: an adjacently tagged
/// enum written by [`serialize`](Self::serialize) comes back as the same
/// variant from [`deserialize`](Self::deserialize).
pub trait SerializeCommits: Send + Sync {
    /// Write `value` to `writer`.
    ///
    /// # Errors
    ///
    /// [`SerializationError::Codec`] if the value cannot be encoded,
    /// [`SerializationError::Io`] if writing fails.
    fn serialize<W: Write, T: Serialize>(&self, writer: W, value: &T)
    -> Result<(), SerializationError>;

    /// Read one `T` from `reader`.
    ///
    /// # Errors
    ///
    /// [`SerializationError::Codec`] if the bytes do not decode to `T`,
    /// [`SerializationError::Io`] if reading fails.
    fn deserialize<R: Read, T: DeserializeOwned>(&self, reader: R)
    -> Result<T, SerializationError>;

    /// Convenience wrapper around [`serialize`](Self::serialize) into a buffer.
    ///
    /// # Errors
    ///
    /// Same as [`serialize`](Self::serialize).
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        let mut buf = Vec::new();
        self.serialize(&mut buf, value)?;
        Ok(buf)
    }

    /// Convenience wrapper around [`deserialize`](Self::deserialize) from a
    /// slice.
    ///
    /// # Errors
    ///
    /// Same as [`deserialize`](Self::deserialize).
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        self.deserialize(bytes)
    }
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer {
    /// Emit indented output.
    pub pretty: bool,
}

impl JsonSerializer {
    /// Compact output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indented output, handy for files meant to be read by people.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl SerializeCommits for JsonSerializer {
    fn serialize<W: Write, T: Serialize>(
        &self,
        mut writer: W,
        value: &T,
    ) -> Result<(), SerializationError> {
        if self.pretty {
            serde_json::to_writer_pretty(&mut writer, value)?;
        } else {
            serde_json::to_writer(&mut writer, value)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn deserialize<R: Read, T: DeserializeOwned>(
        &self,
        reader: R,
    ) -> Result<T, SerializationError> {
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::test_fixtures::{AccountEvent, attempt};
    use crate::commit::{Commit, EventMessage};

    #[test]
    fn commit_survives_a_round_trip() {
        let mut a = attempt("acc-1", 1, 2, 2);
        a.headers
            .insert("origin".to_owned(), serde_json::json!("import"));
        let commit = a.into_commit(11);

        let codec = JsonSerializer::new();
        let bytes = codec.to_bytes(&commit).expect("serialize should succeed");
        let back: Commit = codec.from_bytes(&bytes).expect("deserialize should succeed");
        assert_eq!(back, commit);
    }

    #[test]
    fn polymorphic_events_keep_their_variant() {
        let events = vec![
            AccountEvent::Opened {
                owner: "ada".to_owned(),
            },
            AccountEvent::Frozen,
        ];
        let messages: Vec<EventMessage> = events
            .iter()
            .map(|e| EventMessage::from_event(e).expect("encode should succeed"))
            .collect();

        let codec = JsonSerializer::pretty();
        let bytes = codec.to_bytes(&messages).expect("serialize should succeed");
        let back: Vec<EventMessage> = codec.from_bytes(&bytes).expect("deserialize should succeed");
        let decoded: Vec<AccountEvent> = back
            .iter()
            .map(|m| m.decode().expect("decode should succeed"))
            .collect();
        assert_eq!(decoded, events);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = JsonSerializer::new()
            .from_bytes::<Commit>(b"{ nope")
            .expect_err("garbage should not decode");
        assert!(matches!(err, SerializationError::Codec(_)));
    }

    #[test]
    fn failing_writer_surfaces_an_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("sink closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = JsonSerializer::new()
            .serialize(Broken, &serde_json::json!({ "a": 1 }))
            .expect_err("write should fail");
        // serde_json reports writer failures through its own error type.
        assert!(matches!(
            err,
            SerializationError::Codec(_) | SerializationError::Io(_)
        ));
    }
}
