//! Reconnect records and their append-only log
//!
//! Each registered target gets a random cookie that lets it reclaim its
//! TargetId after a broker restart or a dropped connection. Records are
//! appended to a plain-text log, one per line:
//!
//! ```text
//! <peer-ip> <ccbid> <cookie>
//! ```
//!
//! Expired records are dropped by a periodic sweep, which then rewrites the
//! whole log (write to `<log>.new`, fsync, rename over the log).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::ccbid::{parse_id, TargetId};
use crate::error::StoreError;

/// Suffix every reconnect log carries
pub const RECONNECT_SUFFIX: &str = ".ccb_reconnect";

/// One outstanding identity lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectInfo {
    pub target_id: TargetId,
    pub cookie: u64,
    pub peer_ip: String,
    /// Unix seconds
    pub last_alive: u64,
}

impl ReconnectInfo {
    pub fn new(target_id: TargetId, cookie: u64, peer_ip: impl Into<String>, now: u64) -> Self {
        ReconnectInfo {
            target_id,
            cookie,
            peer_ip: peer_ip.into(),
            last_alive: now,
        }
    }

    pub fn alive(&mut self, now: u64) {
        self.last_alive = now;
    }

    fn to_line(&self) -> String {
        format!("{} {} {}\n", self.peer_ip, self.target_id, self.cookie)
    }
}

/// Parse one log line into (peer ip, ccbid, cookie)
fn parse_line(line: &str) -> Option<(String, TargetId, u64)> {
    let mut fields = line.split_whitespace();
    let ip = fields.next()?;
    let id = parse_id(fields.next()?)?;
    let cookie = parse_id(fields.next()?)?;
    Some((ip.to_string(), id, cookie))
}

/// In-memory reconnect records backed by the log file
pub struct ReconnectStore {
    records: HashMap<TargetId, ReconnectInfo>,
    path: Option<PathBuf>,
    /// Append handle, opened lazily
    log: Option<BufWriter<File>>,
}

impl ReconnectStore {
    /// Create an empty store; `None` keeps records in memory only
    pub fn new(path: Option<PathBuf>) -> Self {
        ReconnectStore {
            records: HashMap::new(),
            path,
            log: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: TargetId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: TargetId) -> Option<&ReconnectInfo> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut ReconnectInfo> {
        self.records.get_mut(&id)
    }

    /// Insert or replace the record for `info.target_id`
    pub fn insert(&mut self, info: ReconnectInfo) {
        self.records.insert(info.target_id, info);
    }

    pub fn remove(&mut self, id: TargetId) -> Option<ReconnectInfo> {
        self.records.remove(&id)
    }

    /// Load every valid record from the log.
    ///
    /// Returns the highest ccbid seen, or `None` if there is no log. Bad
    /// lines are skipped with a warning.
    pub fn load(&mut self, now: u64) -> Result<Option<TargetId>, StoreError> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(None),
        };

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut highest = 0;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Some((ip, id, cookie)) => {
                    highest = highest.max(id);
                    self.insert(ReconnectInfo::new(id, cookie, ip, now));
                }
                None => {
                    log::warn!(
                        "Skipping invalid line {} in {}",
                        index + 1,
                        path.display()
                    );
                }
            }
        }

        log::info!(
            "Loaded {} reconnect records from {}",
            self.records.len(),
            path.display()
        );
        Ok(Some(highest))
    }

    /// Append one record to the log
    pub fn append(&mut self, info: &ReconnectInfo) -> Result<(), StoreError> {
        let path = self.path.clone().ok_or(StoreError::NoPath)?;
        if self.log.is_none() {
            self.log = Some(BufWriter::new(open_append(&path)?));
        }
        match self.log.as_mut() {
            Some(log) => log
                .write_all(info.to_line().as_bytes())
                .map_err(|e| StoreError::io(&path, e)),
            None => Err(StoreError::NoPath),
        }
    }

    /// Push buffered appends to the file
    pub fn flush(&mut self) {
        if let (Some(log), Some(path)) = (self.log.as_mut(), self.path.as_ref()) {
            if let Err(e) = log.flush() {
                log::warn!("Failed to flush {}: {}", path.display(), e);
            }
        }
    }

    /// Expire stale records.
    ///
    /// Records of `live` targets are refreshed first; anything whose
    /// `last_alive` is more than twice `interval` old is removed. If any
    /// record was removed the log is compacted. Returns the number removed.
    pub fn sweep(
        &mut self,
        now: u64,
        interval: u64,
        live: impl IntoIterator<Item = TargetId>,
    ) -> usize {
        for id in live {
            match self.records.get_mut(&id) {
                Some(info) => info.alive(now),
                None => log::warn!("Live target ccbid {} has no reconnect record", id),
            }
        }

        let limit = interval.saturating_mul(2);
        let before = self.records.len();
        self.records
            .retain(|_, info| now.saturating_sub(info.last_alive) <= limit);
        let removed = before - self.records.len();

        if removed > 0 {
            log::info!("Pruning {} expired reconnect records", removed);
            if let Err(e) = self.rewrite() {
                log::warn!("Keeping old reconnect log: {}", e);
            }
        }

        removed
    }

    /// Rewrite the log from the in-memory records
    pub fn rewrite(&mut self) -> Result<(), StoreError> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        // drop the append handle; it would point at the replaced file
        self.flush();
        self.log = None;

        if self.records.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::io(&path, e)),
            };
        }

        let temp_path = temp_path_for(&path);
        let result = self.write_all_to(&temp_path);
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, &path).map_err(|e| StoreError::io(&path, e))
    }

    fn write_all_to(&self, temp_path: &Path) -> Result<(), StoreError> {
        let file = create_truncate(temp_path)?;
        let mut writer = BufWriter::new(file);
        for info in self.records.values() {
            writer
                .write_all(info.to_line().as_bytes())
                .map_err(|e| StoreError::io(temp_path, e))?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io(temp_path, e.into_error()))?;
        file.sync_all().map_err(|e| StoreError::io(temp_path, e))
    }

    /// Move the log to a new path (reconfiguration)
    pub fn relocate(&mut self, new_path: Option<PathBuf>) {
        if new_path == self.path {
            return;
        }
        self.flush();
        self.log = None;

        if let (Some(old), Some(new)) = (self.path.as_ref(), new_path.as_ref()) {
            match fs::remove_file(new) {
                Ok(()) => log::debug!("Replaced existing reconnect log {}", new.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::debug!("Failed to remove {}: {}", new.display(), e),
            }
            match fs::rename(old, new) {
                Ok(()) => log::info!("Moved reconnect log {} to {}", old.display(), new.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "Failed to move reconnect log {} to {}: {}",
                    old.display(),
                    new.display(),
                    e
                ),
            }
        }
        self.path = new_path;
    }
}

impl Drop for ReconnectStore {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Ensure a configured log name carries the reconnect suffix
pub fn with_reconnect_suffix(path: PathBuf) -> PathBuf {
    if path.to_string_lossy().contains(RECONNECT_SUFFIX) {
        return path;
    }
    let mut name = path.into_os_string();
    name.push(RECONNECT_SUFFIX);
    PathBuf::from(name)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".new");
    PathBuf::from(name)
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).map_err(|e| StoreError::io(path, e))
}

fn create_truncate(path: &Path) -> Result<File, StoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).map_err(|e| StoreError::io(path, e))
}

/// Current time in unix seconds
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
