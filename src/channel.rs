/// Single-slot mailbox for pushing option updates into a running workload.
///
/// The channel is a fixed-size file region:
///
/// ```text
/// [0..8)   magic "BSTUNE01"
/// [8..16)  sequence number, u64 little-endian
/// [16..20) payload length, u32 little-endian
/// [20..)   payload, zero padded to CHANNEL_CAPACITY
/// ```
///
/// A publish rewrites the whole region into a temp file and renames it over
/// the channel path, so a reader never observes a partial blob. There is no
/// queue: a newer publish replaces an unread older one.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Total size of the region in bytes.
pub const CHANNEL_CAPACITY: usize = 64 * 1024;
const MAGIC: &[u8; 8] = b"BSTUNE01";
const HEADER_LEN: usize = 20;

#[derive(Debug)]
pub enum ChannelError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    TooLarge { len: usize, capacity: usize },
    #[cfg(test)]
    Corrupt { path: PathBuf, reason: &'static str },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Io { path, source } => {
                write!(f, "tuning channel I/O on {}: {}", path.display(), source)
            }
            ChannelError::TooLarge { len, capacity } => {
                write!(f, "tuning blob of {len} bytes exceeds channel capacity {capacity}")
            }
            #[cfg(test)]
            ChannelError::Corrupt { path, reason } => {
                write!(f, "tuning channel {} is corrupt: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Publishing side of the channel, owned by the controller.
#[derive(Debug)]
pub struct SharedTuningChannel {
    path: PathBuf,
    sequence: u64,
}

impl SharedTuningChannel {
    /// Create (or reset) the channel with an empty slot.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let channel = Self {
            path: path.into(),
            sequence: 0,
        };
        channel.publish(0, b"")?;
        tracing::debug!(path = %channel.path.display(), "tuning channel created");
        Ok(channel)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tell the workload where to poll for updates.
    pub fn attach(&self, argv: &mut Vec<String>) {
        argv.push(format!("--dynamic_options_file={}", self.path.display()));
    }

    /// Publish a new blob, replacing any unread one. Returns its sequence number.
    pub fn write(&mut self, blob: &str) -> Result<u64, ChannelError> {
        let sequence = self.sequence + 1;
        self.publish(sequence, blob.as_bytes())?;
        self.sequence = sequence;
        tracing::info!(
            sequence = self.sequence,
            bytes = blob.len(),
            "published live tuning blob"
        );
        Ok(self.sequence)
    }

    fn publish(&self, sequence: u64, payload: &[u8]) -> Result<(), ChannelError> {
        let region = encode(sequence, payload)?;
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ChannelError::Io { path, source }
        };

        let lock = open_lock(&self.path)?;
        FileExt::lock_exclusive(&lock).map_err(io_err(&self.path))?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
        tmp.write_all(&region).map_err(io_err(tmp.path()))?;
        tmp.flush().map_err(io_err(tmp.path()))?;
        tmp.persist(&self.path)
            .map_err(|e| io_err(&self.path)(e.error))?;

        let _ = FileExt::unlock(&lock);
        Ok(())
    }
}

/// Consuming side: what the workload does when it polls the channel.
#[cfg(test)]
#[derive(Debug)]
pub struct ChannelReader {
    path: PathBuf,
    last_seen: u64,
}

#[cfg(test)]
impl ChannelReader {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seen: 0,
        }
    }

    /// The newest blob not yet seen by this reader, if any.
    pub fn poll(&mut self) -> Result<Option<String>, ChannelError> {
        let lock = open_lock(&self.path)?;
        FileExt::lock_shared(&lock).map_err(|source| ChannelError::Io {
            path: self.path.clone(),
            source,
        })?;
        let bytes = std::fs::read(&self.path).map_err(|source| ChannelError::Io {
            path: self.path.clone(),
            source,
        });
        let _ = FileExt::unlock(&lock);

        let bytes = bytes?;
        let (sequence, payload) = decode(&bytes).map_err(|reason| ChannelError::Corrupt {
            path: self.path.clone(),
            reason,
        })?;
        if sequence <= self.last_seen {
            return Ok(None);
        }
        self.last_seen = sequence;
        Ok(Some(String::from_utf8_lossy(payload).into_owned()))
    }
}

fn open_lock(path: &Path) -> Result<File, ChannelError> {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|source| ChannelError::Io {
            path: PathBuf::from(lock_path),
            source,
        })
}

fn encode(sequence: u64, payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let capacity = CHANNEL_CAPACITY - HEADER_LEN;
    if payload.len() > capacity {
        return Err(ChannelError::TooLarge {
            len: payload.len(),
            capacity,
        });
    }
    let mut region = vec![0u8; CHANNEL_CAPACITY];
    region[..8].copy_from_slice(MAGIC);
    region[8..16].copy_from_slice(&sequence.to_le_bytes());
    region[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    region[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    Ok(region)
}

#[cfg(test)]
fn decode(region: &[u8]) -> Result<(u64, &[u8]), &'static str> {
    if region.len() < HEADER_LEN {
        return Err("region shorter than header");
    }
    if &region[..8] != MAGIC {
        return Err("bad magic");
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&region[8..16]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&region[16..20]);
    let len = u32::from_le_bytes(len) as usize;
    let payload = region
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or("payload length exceeds region")?;
    Ok((u64::from_le_bytes(seq), payload))
}
