use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

/// One executed command as it is stored in `commands.jsonl`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub id: String,          // Record unique identifier
    pub session_id: String,  // Shell session this command ran in
    pub command: String,     // Command text as invoked
    #[serde(with = "output_bytes")]
    pub output: Vec<u8>,     // Merged stdout+stderr, capped
    pub output_truncated: bool,
    pub output_total_bytes: u64, // Bytes the child produced, retained or not
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub cwd: PathBuf,
    pub shell: String,
    pub hostname: String,
    pub username: String,
}

/// Lifetime of one shell as it is stored in `sessions.jsonl`.
///
/// A session may appear more than once in the stream: the first entry is
/// written when the session records its first command, a later one carries
/// `ended_at`. Readers fold them per `session_id`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub shell: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record id is empty")]
    EmptyId,
    #[error("session id is empty")]
    EmptySession,
    #[error("command text is empty")]
    EmptyCommand,
    #[error("end time {end} precedes start time {start}")]
    NegativeDuration {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("retained output ({retained} bytes) exceeds the total produced ({total} bytes)")]
    OutputOverflow { retained: usize, total: u64 },
}

impl CommandRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        if self.session_id.is_empty() {
            return Err(RecordError::EmptySession);
        }
        if self.command.trim().is_empty() {
            return Err(RecordError::EmptyCommand);
        }
        if self.end_time < self.start_time {
            return Err(RecordError::NegativeDuration {
                start: self.start_time,
                end: self.end_time,
            });
        }
        if self.output.len() as u64 > self.output_total_bytes {
            return Err(RecordError::OutputOverflow {
                retained: self.output.len(),
                total: self.output_total_bytes,
            });
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration().num_milliseconds()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// First whitespace-delimited token of the command, used for frequency ranking.
    pub fn program(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or("")
    }

    /// Output for display; invalid UTF-8 is replaced.
    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

impl SessionRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.session_id.is_empty() {
            return Err(RecordError::EmptySession);
        }
        if let Some(ended) = self.ended_at {
            if ended < self.started_at {
                return Err(RecordError::NegativeDuration {
                    start: self.started_at,
                    end: ended,
                });
            }
        }
        Ok(())
    }
}

/// Derive a record id from the values that make a capture unique.
pub fn record_id(session_id: &str, start_time: DateTime<Utc>, command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0]);
    hasher.update(
        start_time
            .timestamp_nanos_opt()
            .unwrap_or_else(|| start_time.timestamp())
            .to_le_bytes(),
    );
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(command.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// Serialize one entry as a single newline-terminated line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value).context("Failed to serialize record to JSON")?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    serde_json::from_slice(line).context("Failed to parse record from JSON line")
}

/// Output is kept as a JSON string when it is valid UTF-8 and as
/// `{"base64": "..."}` otherwise, so the exact bytes survive a round trip.
mod output_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => Encoded::Binary {
                base64: general_purpose::STANDARD.encode(bytes),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Encoded::deserialize(deserializer)? {
            Encoded::Text(text) => Ok(text.into_bytes()),
            Encoded::Binary { base64 } => general_purpose::STANDARD
                .decode(base64)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample(
        id: &str,
        session: &str,
        command: &str,
        output: &[u8],
        start_secs: i64,
    ) -> CommandRecord {
        let start = Utc.timestamp_opt(start_secs, 123_456_789).unwrap();
        CommandRecord {
            id: id.to_string(),
            session_id: session.to_string(),
            command: command.to_string(),
            output: output.to_vec(),
            output_truncated: false,
            output_total_bytes: output.len() as u64,
            exit_code: 0,
            start_time: start,
            end_time: start + Duration::milliseconds(15),
            cwd: PathBuf::from("/tmp"),
            shell: "bash".to_string(),
            hostname: "localhost".to_string(),
            username: "tester".to_string(),
        }
    }

    #[test]
    fn round_trip_keeps_every_field() {
        let record = sample("a1", "s1", "echo hi", b"hi\n", 1_700_000_000);
        let line = encode_line(&record).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);

        let decoded: CommandRecord = decode_line(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.start_time.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn binary_output_survives_round_trip() {
        let output = vec![0xff, 0xfe, b'o', b'k', 0x1b, b'[', b'm', 0x00];
        let record = sample("b1", "s1", "cat blob", &output, 1_700_000_000);
        let line = encode_line(&record).unwrap();
        let text = String::from_utf8(line.clone()).unwrap();
        assert!(text.contains("\"base64\""));

        let decoded: CommandRecord = decode_line(&line).unwrap();
        assert_eq!(decoded.output, output);
    }

    #[test]
    fn validation_rejects_bad_records() {
        let mut record = sample("c1", "s1", "ls", b"", 1_700_000_000);
        assert!(record.validate().is_ok());

        record.end_time = record.start_time - Duration::seconds(1);
        assert!(matches!(
            record.validate(),
            Err(RecordError::NegativeDuration { .. })
        ));

        let mut record = sample("c2", "", "ls", b"", 1_700_000_000);
        assert_eq!(record.validate(), Err(RecordError::EmptySession));
        record.session_id = "s1".to_string();
        record.command = "   ".to_string();
        assert_eq!(record.validate(), Err(RecordError::EmptyCommand));

        let mut record = sample("c3", "s1", "ls", b"abc", 1_700_000_000);
        record.output_total_bytes = 2;
        assert!(matches!(
            record.validate(),
            Err(RecordError::OutputOverflow { .. })
        ));
    }

    #[test]
    fn program_is_first_token() {
        let record = sample("d1", "s1", "  git   status -s", b"", 1_700_000_000);
        assert_eq!(record.program(), "git");
        assert_eq!(record.duration_ms(), 15);
    }

    #[test]
    fn record_ids_differ_per_start_time() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let a = record_id("s1", t, "ls");
        let b = record_id("s1", t + Duration::nanoseconds(1), "ls");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn session_without_end_parses() {
        let line = concat!(
            r#"{"session_id":"s1","shell":"zsh","hostname":"h","#,
            r#""started_at":"2024-01-01T00:00:00Z"}"#
        );
        let session: SessionRecord = decode_line(line.as_bytes()).unwrap();
        assert_eq!(session.ended_at, None);
        assert!(session.validate().is_ok());
    }
}
