/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Point-in-time checkpoints of an entity, used to bound how much of the log has to be replayed on restart.
//!
//! A snapshot file holds a single JSON object:
//!
//! ```json
//! {
//!     "data": "<base64(JSON entity)>",
//!     "type": "COMMUNITY",
//!     "sequence_number": 200,
//!     "timestamp": "2023-11-30T07:27:44Z"
//! }
//! ```
//!
//! A [`SnapshotStore`] keeps at most one "current" snapshot in its directory. Superseded snapshots are
//! [archived](SnapshotStore::archive) under a name that embeds their sequence number and the time of
//! archival, never deleted.

use std::{
    fmt::{self, Display, Formatter},
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{transitions::SubscriptionCategory, types::basic::SequenceNumber, wal::sync_dir};

const CURRENT: &str = "snapshot";
const STAGING: &str = "snapshot.tmp";

/// Everything in a snapshot except the entity itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub category: SubscriptionCategory,
    pub sequence_number: SequenceNumber,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    data: String,
    #[serde(rename = "type")]
    category: SubscriptionCategory,
    sequence_number: SequenceNumber,
    timestamp: DateTime<Utc>,
}

/// Serialize `entity`, which reflects every transition up to and including `sequence_number`, into
/// `writer`.
pub fn write_snapshot<W: Write, E: Serialize>(
    writer: W,
    entity: &E,
    category: SubscriptionCategory,
    sequence_number: SequenceNumber,
) -> Result<SnapshotMetadata, SnapshotError> {
    let data = serde_json::to_vec(entity)?;
    let file = SnapshotFile {
        data: STANDARD.encode(data),
        category,
        sequence_number,
        timestamp: Utc::now(),
    };
    serde_json::to_writer(writer, &file)?;

    Ok(SnapshotMetadata {
        category,
        sequence_number,
        timestamp: file.timestamp,
    })
}

/// Read a snapshot from `reader`, decoding its entity into `destination`.
///
/// `destination` is only overwritten if the whole snapshot decodes.
pub fn read_snapshot<R: Read, E: DeserializeOwned>(
    reader: R,
    destination: &mut E,
) -> Result<SnapshotMetadata, SnapshotError> {
    let file: SnapshotFile = serde_json::from_reader(reader)?;
    let data = STANDARD.decode(file.data)?;
    *destination = serde_json::from_slice(&data)?;

    Ok(SnapshotMetadata {
        category: file.category,
        sequence_number: file.sequence_number,
        timestamp: file.timestamp,
    })
}

/// A directory holding the current snapshot of one entity, and the archives of its previous snapshots.
pub struct SnapshotStore {
    dir: PathBuf,
    category: SubscriptionCategory,
}

impl SnapshotStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        category: SubscriptionCategory,
    ) -> Result<SnapshotStore, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotStore { dir, category })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT)
    }

    pub fn exists(&self) -> bool {
        self.current_path().is_file()
    }

    /// Decode the current snapshot, if there is one.
    pub fn load<E: DeserializeOwned + Default>(
        &self,
    ) -> Result<Option<(E, SnapshotMetadata)>, SnapshotError> {
        let file = match File::open(self.current_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut entity = E::default();
        let metadata = read_snapshot(BufReader::new(file), &mut entity)?;
        if metadata.category != self.category {
            return Err(SnapshotError::CategoryMismatch {
                expected: self.category,
                found: metadata.category,
            });
        }
        Ok(Some((entity, metadata)))
    }

    /// Replace the current snapshot with one of `entity` at `sequence_number`.
    ///
    /// The new snapshot is staged in a separate file and renamed over the current one, so a crash leaves
    /// either the old or the new snapshot in place, never a partial one.
    pub fn save<E: Serialize>(
        &self,
        entity: &E,
        sequence_number: SequenceNumber,
    ) -> Result<SnapshotMetadata, SnapshotError> {
        let staging = self.dir.join(STAGING);
        let metadata = {
            let file = File::create(&staging)?;
            let mut writer = BufWriter::new(file);
            let metadata = write_snapshot(&mut writer, entity, self.category, sequence_number)?;
            let file = writer.into_inner().map_err(|err| err.into_error())?;
            file.sync_all()?;
            metadata
        };

        fs::rename(&staging, self.current_path())?;
        sync_dir(&self.dir)?;
        Ok(metadata)
    }

    /// Copy the current snapshot, if any, to `snapshot-<sequence number>-<unix secs>` and return the
    /// archive's path.
    ///
    /// The current snapshot is left in place: it is only ever replaced by [`save`](Self::save), and only
    /// after the archive is complete and durable.
    pub fn archive(&self) -> Result<Option<PathBuf>, SnapshotError> {
        let current = self.current_path();
        let metadata = match File::open(&current) {
            Ok(file) => {
                let mut discard = serde_json::Value::Null;
                read_snapshot(BufReader::new(file), &mut discard)?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let name = format!(
            "{}-{}-{}",
            CURRENT,
            metadata.sequence_number,
            Utc::now().timestamp()
        );
        let archive = self.dir.join(&name);
        let staging = self.dir.join(format!("{}.tmp", name));

        fs::copy(&current, &staging)?;
        File::open(&staging)?.sync_all()?;
        fs::rename(&staging, &archive)?;
        sync_dir(&self.dir)?;

        Ok(Some(archive))
    }

    /// Paths of every archived snapshot, oldest sequence number first.
    pub fn archives(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        let mut archives: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let sequence_number = name
                .strip_prefix("snapshot-")
                .filter(|rest| !rest.ends_with(".tmp"))
                .and_then(|rest| rest.split('-').next())
                .and_then(|seq| seq.parse::<u64>().ok());
            if let Some(sequence_number) = sequence_number {
                archives.push((sequence_number, entry.path()));
            }
        }
        archives.sort();
        Ok(archives.into_iter().map(|(_, path)| path).collect())
    }
}

#[derive(Debug)]
pub enum SnapshotError {
    Io(io::Error),
    Json(serde_json::Error),
    Base64(base64::DecodeError),
    /// The snapshot was taken of a different kind of entity than the store holds.
    CategoryMismatch {
        expected: SubscriptionCategory,
        found: SubscriptionCategory,
    },
}

impl Display for SnapshotError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Io(err) => write!(f, "snapshot i/o failed: {}", err),
            SnapshotError::Json(err) => write!(f, "snapshot is not valid JSON: {}", err),
            SnapshotError::Base64(err) => write!(f, "snapshot data is not base64: {}", err),
            SnapshotError::CategoryMismatch { expected, found } => write!(
                f,
                "expected a snapshot of {} state, found one of {} state",
                expected, found
            ),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(value: io::Error) -> Self {
        SnapshotError::Io(value)
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(value: serde_json::Error) -> Self {
        SnapshotError::Json(value)
    }
}

impl From<base64::DecodeError> for SnapshotError {
    fn from(value: base64::DecodeError) -> Self {
        SnapshotError::Base64(value)
    }
}
