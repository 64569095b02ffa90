/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable, append-only, sequence-numbered record of transitions.
//!
//! ## Format
//!
//! A log is a UTF-8 text file with one record per line:
//!
//! ```text
//! <sequence number> <base64(JSON envelope)>\n
//! ```
//!
//! Base64 never contains a line break, so a reader can scan forward line by line without ever parsing a
//! partial JSON object, and a crash in the middle of an append can damage at most the last line.
//!
//! ## Durability
//!
//! [`WriteAheadLog::append`] only returns after the line has been written and synced to the storage medium.
//! Callers must not publish the effects of a transition before `append` returns `Ok`: on any crash,
//! replaying the log must be enough to reach the last acknowledged state.
//!
//! ## Reading back
//!
//! [`WriteAheadLog::read_all`] returns every valid entry up to the first line that fails to decode, and
//! classifies that line:
//! - If it is the last line of the file, it is a [torn tail](LogTail::Torn), the remains of an append that
//!   never returned. The log simply ends there.
//! - Otherwise, it is [corruption](LogTail::Corrupted): something rewrote the middle of the log.

use std::{
    fmt::{self, Display, Formatter},
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    str,
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;

use crate::{
    transitions::{
        envelope::TransitionEnvelope,
        registry::{DecodeError, TransitionRegistry},
    },
    types::basic::SequenceNumber,
};

/// A write-ahead log backed by a single file.
///
/// All appends go through one writer lock, so concurrent callers serialize rather than interleave their
/// lines.
pub struct WriteAheadLog {
    path: PathBuf,
    registry: Arc<TransitionRegistry>,
    writer: Mutex<File>,
}

impl WriteAheadLog {
    /// Open the log at `path`, creating an empty one if it does not exist.
    pub fn open(
        path: impl Into<PathBuf>,
        registry: Arc<TransitionRegistry>,
    ) -> Result<WriteAheadLog, WalError> {
        let path = path.into();
        let writer = open_for_append(&path)?;
        Ok(WriteAheadLog {
            path,
            registry,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp `envelope` with its commit time, durably append it, and return the stamped envelope.
    pub fn append(&self, envelope: &TransitionEnvelope) -> Result<TransitionEnvelope, WalError> {
        let mut committed = envelope.clone();
        committed.committed_at = Some(Utc::now());
        let line = encode_line(&committed)?;

        let mut writer = self.writer.lock().unwrap();
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        writer.sync_data()?;

        Ok(committed)
    }

    /// Read every valid entry in the log, in file order.
    pub fn read_all(&self) -> Result<LogContents, WalError> {
        let _writer = self.writer.lock().unwrap();
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        let mut offset = 0;
        let mut line_number = 0;
        while offset < bytes.len() {
            line_number += 1;
            let (line, next, terminated) = match bytes[offset..].iter().position(|b| *b == b'\n') {
                Some(len) => (&bytes[offset..offset + len], offset + len + 1, true),
                None => (&bytes[offset..], bytes.len(), false),
            };

            let decoded = if terminated {
                str::from_utf8(line)
                    .map_err(|_| WalError::MalformedLine {
                        reason: "line is not valid UTF-8",
                    })
                    .and_then(|line| decode_line(&self.registry, line))
            } else {
                Err(WalError::MalformedLine {
                    reason: "line has no terminator",
                })
            };

            match decoded {
                Ok(entry) => {
                    entries.push(entry);
                    offset = next;
                }
                Err(error) => {
                    let tail = if next >= bytes.len() {
                        LogTail::Torn {
                            line: line_number,
                            error,
                        }
                    } else {
                        LogTail::Corrupted {
                            line: line_number,
                            error,
                        }
                    };
                    return Ok(LogContents {
                        entries,
                        tail,
                        valid_len: offset as u64,
                    });
                }
            }
        }

        Ok(LogContents {
            entries,
            tail: LogTail::Clean,
            valid_len: offset as u64,
        })
    }

    /// Cut the log down to its first `len` bytes, e.g. to drop a torn tail before appending again.
    pub fn truncate_to(&self, len: u64) -> Result<(), WalError> {
        let writer = self.writer.lock().unwrap();
        writer.set_len(len)?;
        writer.sync_all()?;
        Ok(())
    }

    /// Move the live log to `archive_path` and continue with an empty log at the original path.
    pub fn rotate(&self, archive_path: &Path) -> Result<(), WalError> {
        let mut writer = self.writer.lock().unwrap();
        writer.sync_all()?;
        fs::rename(&self.path, archive_path)?;
        *writer = open_for_append(&self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }
}

/// Everything [`WriteAheadLog::read_all`] could recover from a log.
#[derive(Debug)]
pub struct LogContents {
    pub entries: Vec<TransitionEnvelope>,
    pub tail: LogTail,
    /// Length in bytes of the prefix of the file that holds `entries`.
    pub valid_len: u64,
}

impl LogContents {
    pub fn last_sequence_number(&self) -> Option<SequenceNumber> {
        self.entries.last().map(|entry| entry.sequence_number)
    }
}

/// How a log ends.
#[derive(Debug)]
pub enum LogTail {
    /// Every line decoded.
    Clean,

    /// The last line failed to decode. Left behind by an append that never returned.
    Torn { line: usize, error: WalError },

    /// A line that failed to decode is followed by more lines.
    Corrupted { line: usize, error: WalError },
}

/// Encode `envelope` into one terminated log line.
pub fn encode_line(envelope: &TransitionEnvelope) -> Result<String, WalError> {
    let json = envelope.to_bytes().map_err(WalError::Serialize)?;
    Ok(format!(
        "{} {}\n",
        envelope.sequence_number,
        STANDARD.encode(json)
    ))
}

/// Decode one log line, without its terminator.
///
/// Fails with [`WalError::SequenceMismatch`] if the sequence number in the line's prefix is not the one
/// embedded in the envelope.
pub fn decode_line(
    registry: &TransitionRegistry,
    line: &str,
) -> Result<TransitionEnvelope, WalError> {
    let (prefix, payload) = line.split_once(' ').ok_or(WalError::MalformedLine {
        reason: "line has no separator",
    })?;
    let prefix = prefix
        .parse::<u64>()
        .map(SequenceNumber::new)
        .map_err(|_| WalError::MalformedLine {
            reason: "sequence number prefix is not an unsigned integer",
        })?;
    let json = STANDARD.decode(payload.trim_end_matches('\r'))?;
    let envelope = TransitionEnvelope::from_bytes(registry, &json)?;

    if envelope.sequence_number != prefix {
        return Err(WalError::SequenceMismatch {
            prefix,
            embedded: envelope.sequence_number,
        });
    }

    Ok(envelope)
}

fn open_for_append(path: &Path) -> Result<File, WalError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Make the creation, removal, or renaming of entries in `dir` durable.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[derive(Debug)]
pub enum WalError {
    Io(io::Error),
    Serialize(serde_json::Error),
    MalformedLine { reason: &'static str },
    Base64(base64::DecodeError),
    Decode(DecodeError),
    /// The sequence number prefixing a line differs from the one in the envelope it holds.
    SequenceMismatch {
        prefix: SequenceNumber,
        embedded: SequenceNumber,
    },
}

impl Display for WalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WalError::Io(err) => write!(f, "log i/o failed: {}", err),
            WalError::Serialize(err) => write!(f, "failed to serialize envelope: {}", err),
            WalError::MalformedLine { reason } => write!(f, "malformed log line: {}", reason),
            WalError::Base64(err) => write!(f, "log line payload is not base64: {}", err),
            WalError::Decode(err) => write!(f, "log line holds an undecodable envelope: {}", err),
            WalError::SequenceMismatch { prefix, embedded } => write!(
                f,
                "log line is prefixed with sequence number {}, but holds sequence number {}",
                prefix, embedded
            ),
        }
    }
}

impl std::error::Error for WalError {}

impl From<io::Error> for WalError {
    fn from(value: io::Error) -> Self {
        WalError::Io(value)
    }
}

impl From<base64::DecodeError> for WalError {
    fn from(value: base64::DecodeError) -> Self {
        WalError::Base64(value)
    }
}

impl From<DecodeError> for WalError {
    fn from(value: DecodeError) -> Self {
        WalError::Decode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        transitions::InitCommunity,
        types::{
            basic::CommunityID,
            community::{BacknetType, Community},
        },
    };

    fn init(seq: u64) -> TransitionEnvelope {
        let community = Community::new(CommunityID::new("c0"), "My Community", BacknetType::Ipfs);
        TransitionEnvelope::new(InitCommunity { community }, SequenceNumber::new(seq))
    }

    #[test]
    fn line_has_prefix_and_single_terminator() {
        let line = encode_line(&init(7)).unwrap();
        assert!(line.starts_with("7 "));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn mismatched_prefix_is_rejected() {
        let registry = TransitionRegistry::standard();
        let line = encode_line(&init(1)).unwrap();
        let forged = line.trim_end().replacen("1 ", "2 ", 1);

        match decode_line(&registry, &forged) {
            Err(WalError::SequenceMismatch { prefix, embedded }) => {
                assert_eq!(prefix, SequenceNumber::new(2));
                assert_eq!(embedded, SequenceNumber::new(1));
            }
            other => panic!("expected a sequence mismatch, got {:?}", other),
        }
    }

    #[test]
    fn missing_separator_is_malformed() {
        let registry = TransitionRegistry::standard();
        assert!(matches!(
            decode_line(&registry, "12"),
            Err(WalError::MalformedLine { .. })
        ));
    }
}
