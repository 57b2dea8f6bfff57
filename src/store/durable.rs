//! Append-only durable log backend for `EntityStore`.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::store::{PersistentStore, StoreWrite};
use crate::utils::FailoverError;

use async_trait::async_trait;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{de::DeserializeOwned, Serialize};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Log file plus its current size. Appends always land at `size`.
struct Backer {
    file: File,
    size: usize,

    /// Bytes that may still be written before writes start failing.
    write_budget: Option<usize>,
}

/// Durable store keeping one log entry per committed batch. Each entry is a
/// u64 length header followed by the rmp-serde encoded batch. A torn entry
/// at the tail is ignored on replay, which makes a batch all-or-nothing.
pub struct LogStore<K, T> {
    path: PathBuf,
    sync: bool,
    backer: Mutex<Backer>,
    _marker: std::marker::PhantomData<fn() -> (K, T)>,
}

impl<K, T> fmt::Debug for LogStore<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LogStore({})", self.path.display())
    }
}

impl<K, T> LogStore<K, T>
where
    K: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens (creating if missing) the log file at `path`. If `sync` is set,
    /// every commit is followed by `sync_data()`.
    pub async fn open(path: &Path, sync: bool) -> Result<Self, FailoverError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("store"; "created log file '{}'", path.display());
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path).await?;
        let size = file.seek(SeekFrom::End(0)).await? as usize;

        Ok(LogStore {
            path: path.to_path_buf(),
            sync,
            backer: Mutex::new(Backer {
                file,
                size,
                write_budget: None,
            }),
            _marker: std::marker::PhantomData,
        })
    }

    /// Current log file size in bytes.
    pub async fn size(&self) -> usize {
        self.backer.lock().await.size
    }

    /// Makes writes fail once `budget` more bytes have been written. `None`
    /// lifts the limit.
    pub async fn set_write_budget(&self, budget: Option<usize>) {
        self.backer.lock().await.write_budget = budget;
    }

    // sibling file a compaction writes its snapshot into
    fn compaction_path(&self) -> PathBuf {
        self.path.with_extension("compact")
    }

    /// Reads the entry at `offset`. Returns `None` at EOF or on a torn tail.
    async fn read_entry(
        backer: &mut Backer,
        offset: usize,
    ) -> Result<(Option<Vec<StoreWrite<K, T>>>, usize), FailoverError> {
        if offset + 8 > backer.size {
            if offset < backer.size {
                pf_warn!("store"; "read header end offset {} out of file bound {}",
                                  offset + 8, backer.size);
            }
            return Ok((None, offset));
        }

        backer.file.seek(SeekFrom::Start(offset as u64)).await?;
        let entry_len = backer.file.read_u64().await? as usize;
        let offset_e = offset + 8 + entry_len;
        if offset_e > backer.size {
            pf_warn!("store"; "read entry invalid length {}", entry_len);
            return Ok((None, offset));
        }

        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        backer.file.read_exact(&mut entry_buf[..]).await?;
        let entry = decode_from_slice(&entry_buf)?;
        Ok((Some(entry), offset_e))
    }

    // length header first, then content
    fn encode_entry(entry: &Vec<StoreWrite<K, T>>) -> Result<Vec<u8>, FailoverError> {
        let entry_bytes = encode_to_vec(entry)?;
        let mut buf = Vec::with_capacity(8 + entry_bytes.len());
        buf.extend_from_slice(&(entry_bytes.len() as u64).to_be_bytes());
        buf.extend_from_slice(&entry_bytes);
        Ok(buf)
    }

    // writes `bytes` at the cursor, failing part way once the budget runs out
    async fn write_bytes(
        file: &mut File,
        bytes: &[u8],
        budget: &mut Option<usize>,
    ) -> Result<(), FailoverError> {
        if let Some(left) = budget.as_mut() {
            if bytes.len() > *left {
                let written = *left;
                file.write_all(&bytes[..written]).await?;
                *left = 0;
                return Err(FailoverError::msg(format!(
                    "write failed after {} of {} bytes",
                    written,
                    bytes.len()
                )));
            }
            *left -= bytes.len();
        }
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn truncate(backer: &mut Backer, size: usize) -> Result<(), FailoverError> {
        backer.file.set_len(size as u64).await?;
        backer.file.seek(SeekFrom::Start(size as u64)).await?;
        backer.size = size;
        Ok(())
    }

    /// Appends one entry. On failure the file is cut back to its previous
    /// size so no partial entry stays in front of later ones.
    async fn append_entry(
        backer: &mut Backer,
        entry: &Vec<StoreWrite<K, T>>,
        sync: bool,
    ) -> Result<(), FailoverError> {
        let buf = Self::encode_entry(entry)?;
        let size = backer.size;

        let mut result = match backer.file.seek(SeekFrom::Start(size as u64)).await {
            Ok(_) => Self::write_bytes(&mut backer.file, &buf, &mut backer.write_budget).await,
            Err(e) => Err(e.into()),
        };
        if result.is_ok() && sync {
            result = backer.file.sync_data().await.map_err(FailoverError::from);
        }

        if let Err(e) = result {
            if let Err(te) = Self::truncate(backer, size).await {
                pf_error!("store"; "cutting torn entry back to {} failed: {}", size, te);
            }
            return Err(e);
        }
        backer.size = size + buf.len();
        Ok(())
    }

    async fn replay(backer: &mut Backer) -> Result<HashMap<K, T>, FailoverError> {
        let mut records = HashMap::new();
        let mut offset = 0;
        loop {
            let (entry, end) = Self::read_entry(backer, offset).await?;
            match entry {
                Some(writes) => {
                    for write in writes {
                        match write.value {
                            Some(v) => records.insert(write.key, v),
                            None => records.remove(&write.key),
                        };
                    }
                    offset = end;
                }
                None => break,
            }
        }

        if offset < backer.size {
            // drop the torn tail so later appends stay readable
            Self::truncate(backer, offset).await?;
        }
        Ok(records)
    }

    // writes and syncs the snapshot into a fresh file at `path`
    async fn write_snapshot(
        path: &Path,
        snapshot: &Vec<StoreWrite<K, T>>,
        budget: &mut Option<usize>,
    ) -> Result<(File, usize), FailoverError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        let mut size = 0;
        if !snapshot.is_empty() {
            let buf = Self::encode_entry(snapshot)?;
            Self::write_bytes(&mut file, &buf, budget).await?;
            size = buf.len();
        }
        file.sync_all().await?;
        Ok((file, size))
    }

    /// Rewrites the log as a single entry holding the live records. The
    /// snapshot is made durable in a sibling file which then replaces the
    /// log, so a failure at any point leaves the old log intact.
    pub async fn compact(&self) -> Result<(), FailoverError> {
        let mut backer = self.backer.lock().await;
        let records = Self::replay(&mut backer).await?;
        let snapshot: Vec<StoreWrite<K, T>> = records
            .into_iter()
            .map(|(key, value)| StoreWrite {
                key,
                value: Some(value),
            })
            .collect();

        let old_size = backer.size;
        let tmp_path = self.compaction_path();
        let written =
            match Self::write_snapshot(&tmp_path, &snapshot, &mut backer.write_budget).await {
                Ok(written) => fs::rename(&tmp_path, &self.path)
                    .await
                    .map(|_| written)
                    .map_err(FailoverError::from),
                Err(e) => Err(e),
            };
        let (mut file, size) = match written {
            Ok(written) => written,
            Err(e) => {
                if let Err(re) = fs::remove_file(&tmp_path).await {
                    pf_warn!("store"; "removing '{}' failed: {}", tmp_path.display(), re);
                }
                return Err(e);
            }
        };

        // the renamed handle now backs the log path
        file.seek(SeekFrom::Start(size as u64)).await?;
        backer.file = file;
        backer.size = size;
        pf_debug!("store"; "compacted '{}' from {} to {} bytes",
                           self.path.display(), old_size, backer.size);
        Ok(())
    }
}

#[async_trait]
impl<K, T> PersistentStore<K, T> for LogStore<K, T>
where
    K: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load_all(&self) -> Result<Vec<(K, T)>, FailoverError> {
        let mut backer = self.backer.lock().await;
        Ok(Self::replay(&mut backer).await?.into_iter().collect())
    }

    async fn commit(&self, writes: Vec<StoreWrite<K, T>>) -> Result<(), FailoverError> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut backer = self.backer.lock().await;
        Self::append_entry(&mut backer, &writes, self.sync).await
    }
}
