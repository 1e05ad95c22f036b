//! Durable write-ahead log of accepted writes.
//!
//! One append-only file per replica; each record is a `u64` big-endian length
//! header followed by a MessagePack-encoded `WalEntry`. Appends happen only
//! from the single store applier task, so no cross-task interleaving of
//! partial writes is possible.

use std::path::Path;

use crate::protocol::Version;
use crate::utils::KvError;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// On-disk record of one accepted write.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub key: String,
    pub value: String,
    pub version: Version,
}

/// Append-only durable log backed by one file.
pub struct WalLog {
    /// Backing file, cursor kept at EOF between operations.
    backer: File,
}

impl WalLog {
    /// Opens (creating if necessary) the backing file at `path` and replays
    /// all complete entries in file order. A truncated tail (e.g. from a
    /// crash mid-append) is tolerated and ignored.
    pub async fn open(path: &Path) -> Result<(Self, Vec<WalEntry>), KvError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created backer file '{}'", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;

        let file_size = backer.metadata().await?.len() as usize;
        let mut entries = vec![];
        let mut offset: usize = 0;
        backer.seek(SeekFrom::Start(0)).await?;

        while offset + 8 <= file_size {
            let entry_len = backer.read_u64().await? as usize;
            if offset + 8 + entry_len > file_size {
                pf_warn!(
                    "log entry at offset {} exceeds file bound {}",
                    offset,
                    file_size
                );
                break;
            }
            let mut entry_buf: Vec<u8> = vec![0; entry_len];
            backer.read_exact(&mut entry_buf[..]).await?;
            entries.push(decode_from_slice(&entry_buf)?);
            offset += 8 + entry_len;
        }

        // discard any incomplete tail so later appends land at a clean end;
        // otherwise the garbage bytes would sit between valid entries and the
        // next replay would stop at them, losing acknowledged writes
        if offset < file_size {
            pf_warn!(
                "truncating incomplete tail at offset {} (file size {})",
                offset,
                file_size
            );
            backer.set_len(offset as u64).await?;
        }

        backer.seek(SeekFrom::End(0)).await?; // cursor to EOF for appends
        pf_info!(
            "replayed {} log entries from '{}'",
            entries.len(),
            path.display()
        );
        Ok((WalLog { backer }, entries))
    }

    /// Appends one entry at EOF, length header first, optionally fsyncing.
    pub async fn append(
        &mut self,
        entry: &WalEntry,
        sync: bool,
    ) -> Result<(), KvError> {
        let entry_bytes = encode_to_vec(entry)?;
        self.backer.write_u64(entry_bytes.len() as u64).await?;
        self.backer.write_all(&entry_bytes[..]).await?;
        if sync {
            self.backer.sync_data().await?;
        }
        Ok(())
    }
}
