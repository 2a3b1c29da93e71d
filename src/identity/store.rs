//! File-backed session store with sliding expiration.
//!
//! Every session lives in `<dir>/<token>.json` and is mirrored in an in-memory
//! index that is rebuilt from the directory by [`SessionStore::open`]. Lookups
//! hit the index first and fall back to the record on a miss; the directory is
//! owned exclusively by the store.
//!
//! Locking:
//! - `index` and `retired` are `parking_lot` locks and are never held across
//!   an `.await`. Reads never wait on each other.
//! - `write_gate` serializes every mutation (create, refresh, delete, lazy and
//!   swept removals) for the duration of that one file operation. A delete that
//!   completes first always wins over a refresh queued behind it, because refresh
//!   re-reads the index under the gate.
//! - All file I/O is bounded by `io_timeout`. A record write that times out
//!   keeps running; once it lands it is removed again if its token has been
//!   retired meanwhile.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::error::SessionError;
use super::principal::AuthUser;
use super::session::{generate_token, is_well_formed, Session, SessionToken};

const SESSION_EXT: &str = "json";
const TMP_SUFFIX: &str = ".json.tmp";
/// Directory entries handled per sweep step before yielding to other tasks.
const SWEEP_CHUNK: usize = 64;
const MAX_TOKEN_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Storage directory; created if absent.
    pub dir: PathBuf,
    /// Sliding expiration window.
    pub duration: StdDuration,
    /// Cadence of the background sweep.
    pub sweep_interval: StdDuration,
    /// Share of `duration` that must have elapsed since the last activity
    /// before a live session is due for refresh.
    pub refresh_fraction: f64,
    /// Upper bound for any single storage operation.
    pub io_timeout: StdDuration,
}

impl SessionSettings {
    pub fn new(dir: impl Into<PathBuf>, duration: StdDuration, sweep_interval: StdDuration) -> Self {
        Self {
            dir: dir.into(),
            duration,
            sweep_interval,
            refresh_fraction: 0.5,
            io_timeout: StdDuration::from_secs(2),
        }
    }

    pub fn with_refresh_fraction(mut self, fraction: f64) -> Self { self.refresh_fraction = fraction; self }

    pub fn with_io_timeout(mut self, timeout: StdDuration) -> Self { self.io_timeout = timeout; self }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.duration.is_zero() { return Err(SessionError::Config("session duration must be positive".into())); }
        if self.sweep_interval.is_zero() { return Err(SessionError::Config("sweep interval must be positive".into())); }
        if self.io_timeout.is_zero() { return Err(SessionError::Config("io timeout must be positive".into())); }
        // At 1.0 a session is never both live and due, so refresh could never fire.
        if !(self.refresh_fraction > 0.0 && self.refresh_fraction < 1.0) {
            return Err(SessionError::Config(format!("refresh fraction must be in (0, 1), got {}", self.refresh_fraction)));
        }
        Ok(())
    }
}

pub struct SessionStore {
    settings: SessionSettings,
    duration: Duration,
    refresh_after: Duration,
    clock: Arc<dyn Clock>,
    index: RwLock<HashMap<SessionToken, Session>>,
    /// Tokens removed by delete, expiry or sweep, with the time they were retired.
    /// They never authenticate or get persisted again.
    retired: Arc<RwLock<HashMap<SessionToken, DateTime<Utc>>>>,
    write_gate: Arc<Mutex<()>>,
}

/// Temp file, sync, then rename over the record so readers only ever see a
/// complete file.
async fn write_atomically(tmp: PathBuf, path: PathBuf, bytes: Vec<u8>) -> std::io::Result<()> {
    let res = async {
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&bytes).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, &path).await
    }.await;
    if res.is_err() { let _ = tokio::fs::remove_file(&tmp).await; }
    res
}

fn short(token: &str) -> &str { &token[..token.len().min(8)] }

fn to_chrono(d: StdDuration) -> Result<Duration, SessionError> {
    Duration::from_std(d).map_err(|e| SessionError::Config(e.to_string()))
}

impl SessionStore {
    /// Create the storage directory if needed and rebuild the index from it.
    /// Expired records and temp files left by an interrupted write are removed;
    /// unreadable records are skipped.
    pub async fn open(settings: SessionSettings, clock: Arc<dyn Clock>) -> Result<Self, SessionError> {
        settings.validate()?;
        let duration = to_chrono(settings.duration)?;
        let refresh_after = to_chrono(settings.duration.mul_f64(settings.refresh_fraction))?;
        let store = Self {
            settings,
            duration,
            refresh_after,
            clock,
            index: RwLock::new(HashMap::new()),
            retired: Arc::new(RwLock::new(HashMap::new())),
            write_gate: Arc::new(Mutex::new(())),
        };
        let dir = store.settings.dir.clone();
        store.io(tokio::fs::create_dir_all(&dir)).await?;
        let loaded = store.reload().await?;
        info!(dir = %dir.display(), loaded, "session store opened");
        Ok(store)
    }

    /// Path of the record for `token`. Only meaningful for well-formed tokens.
    pub fn session_path(&self, token: &str) -> PathBuf { self.settings.dir.join(format!("{token}.{SESSION_EXT}")) }

    /// Number of indexed sessions, live or not yet evicted.
    pub fn len(&self) -> usize { self.index.read().len() }

    pub fn is_empty(&self) -> bool { self.index.read().is_empty() }

    /// Snapshot of the indexed record for `token`.
    pub fn get(&self, token: &str) -> Option<Session> { self.index.read().get(token).cloned() }

    /// Issue a new session for `user` and persist it before handing out the token.
    pub async fn create(&self, user: &AuthUser) -> Result<SessionToken, SessionError> {
        let _gate = self.write_gate.lock().await;
        let token = self.fresh_token().await?;
        let session = Session::new(token.clone(), user, self.clock.now());
        if let Err(e) = self.write_session(&session).await {
            warn!(user_id = user.id, error = %e, "session create failed to persist");
            // The token is never handed out; a write still in flight is reaped.
            self.retire(&token);
            return Err(e);
        }
        self.index.write().insert(token.clone(), session);
        debug!(user_id = user.id, token = short(&token), "session created");
        Ok(token)
    }

    /// Identity of a live session, or `None`. Never extends the session; a stale
    /// entry found here is removed on the spot.
    pub async fn authenticate(&self, token: &str) -> Option<AuthUser> {
        if !is_well_formed(token) || self.is_retired(token) { return None; }
        let now = self.clock.now();
        let cached = self.index.read().get(token).cloned();
        let session = match cached {
            Some(s) => s,
            None => self.load_on_miss(token).await?,
        };
        if session.is_live(now, self.duration) { return Some(session.user()); }
        self.discard_stale(token).await;
        None
    }

    /// True once a live session has gone `refresh_fraction * duration` without
    /// activity.
    pub fn should_refresh(&self, token: &str) -> bool {
        let now = self.clock.now();
        match self.index.read().get(token) {
            Some(s) => s.is_live(now, self.duration) && now - s.last_activity_at >= self.refresh_after,
            None => false,
        }
    }

    /// Move the activity anchor of a live session to now. `Ok(false)` when the
    /// session is gone or no longer live.
    pub async fn refresh(&self, token: &str) -> Result<bool, SessionError> {
        if !is_well_formed(token) { return Err(SessionError::InvalidToken); }
        let _gate = self.write_gate.lock().await;
        let now = self.clock.now();
        let Some(current) = self.index.read().get(token).cloned() else { return Ok(false) };
        if self.is_retired(token) || !current.is_live(now, self.duration) { return Ok(false); }
        let next = current.refreshed(now);
        self.write_session(&next).await?;
        self.index.write().insert(token.to_string(), next);
        debug!(user_id = current.user_id, token = short(token), "session refreshed");
        Ok(true)
    }

    /// Remove a session from memory and storage. Deleting an unknown token is
    /// not an error; the result says whether anything was removed.
    pub async fn delete(&self, token: &str) -> Result<bool, SessionError> {
        if !is_well_formed(token) { return Err(SessionError::InvalidToken); }
        let _gate = self.write_gate.lock().await;
        let was_indexed = self.index.write().remove(token).is_some();
        self.retire(token);
        // If this fails the token stays retired, and the sweep removes the file later.
        let removed_file = self.remove_record(token).await?;
        debug!(token = short(token), indexed = was_indexed, file = removed_file, "session deleted");
        Ok(was_indexed || removed_file)
    }

    /// One pass over the storage directory: removes expired and retired records
    /// and leftover temp files. Works in chunks and takes the write gate per file,
    /// so request handling is never stalled for a whole scan.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let names = match self.list_dir().await {
            Ok(names) => names,
            Err(e) => { warn!(error = %e, "session sweep could not list storage"); return 0; }
        };
        let mut removed = 0usize;
        for chunk in names.chunks(SWEEP_CHUNK) {
            for name in chunk {
                match self.sweep_entry(name, now).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(file = %name, error = %e, "session sweep skipped entry"),
                }
            }
            tokio::task::yield_now().await;
        }
        // Index entries whose file vanished underneath us.
        let dangling: Vec<SessionToken> = self.index.read().iter()
            .filter(|(_, s)| !s.is_live(now, self.duration))
            .map(|(k, _)| k.clone())
            .collect();
        for token in dangling {
            let _gate = self.write_gate.lock().await;
            let still_stale = self.index.read().get(&token).map(|s| !s.is_live(now, self.duration)).unwrap_or(false);
            if still_stale {
                self.index.write().remove(&token);
                self.retire(&token);
            }
        }
        self.prune_retired(now, &names);
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval` until the
    /// store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = self.settings.sweep_interval;
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(store) = weak.upgrade() else { break };
                let removed = store.sweep_expired().await;
                if removed > 0 { debug!(removed, "session_sweep"); }
            }
        })
    }

    async fn fresh_token(&self) -> Result<SessionToken, SessionError> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let candidate = generate_token()?;
            let known = self.index.read().contains_key(&candidate) || self.is_retired(&candidate);
            if known { warn!("session token collision in memory, regenerating"); continue; }
            let path = self.session_path(&candidate);
            if self.io(tokio::fs::try_exists(&path)).await? {
                warn!("session token collision on disk, regenerating");
                continue;
            }
            return Ok(candidate);
        }
        Err(SessionError::Entropy(format!("no unused token after {MAX_TOKEN_ATTEMPTS} attempts")))
    }

    /// Storage lookup for a token the index does not know. Failures count as
    /// absent; a token retired meanwhile is never indexed again.
    async fn load_on_miss(&self, token: &str) -> Option<Session> {
        let session = match self.read_record(&self.session_path(token)).await {
            Ok(Some(s)) if s.token == token => s,
            Ok(_) => return None,
            Err(e) => {
                warn!(token = short(token), error = %e, "session lookup failed, treating as absent");
                return None;
            }
        };
        let mut index = self.index.write();
        if self.is_retired(token) { return None; }
        Some(index.entry(token.to_string()).or_insert(session).clone())
    }

    async fn discard_stale(&self, token: &str) {
        let gate = match self.gate_within_timeout().await {
            Some(g) => g,
            None => { warn!(token = short(token), "stale session left for sweep: store busy"); return; }
        };
        let now = self.clock.now();
        let stale = self.index.read().get(token).map(|s| !s.is_live(now, self.duration)).unwrap_or(false);
        if !stale { return; }
        self.index.write().remove(token);
        self.retire(token);
        if let Err(e) = self.remove_record(token).await {
            warn!(token = short(token), error = %e, "failed to remove expired session record");
        }
        drop(gate);
        debug!(token = short(token), "expired session discarded");
    }

    async fn sweep_entry(&self, name: &str, now: DateTime<Utc>) -> Result<bool, SessionError> {
        let path = self.settings.dir.join(name);
        if name.ends_with(TMP_SUFFIX) {
            // Holding the gate means no write is in flight, so any temp file is leftover.
            let _gate = self.write_gate.lock().await;
            return self.remove_path(&path).await;
        }
        let Some(token) = name.strip_suffix(".json") else { return Ok(false) };
        if !is_well_formed(token) { return Ok(false); }

        let _gate = self.write_gate.lock().await;
        if self.is_retired(token) { return self.remove_path(&path).await; }
        let indexed = self.index.read().get(token).cloned();
        let expired = match indexed {
            Some(s) => !s.is_live(now, self.duration),
            None => match self.read_record(&path).await? {
                Some(s) => !s.is_live(now, self.duration),
                None => false,
            },
        };
        if !expired { return Ok(false); }
        self.index.write().remove(token);
        self.retire(token);
        self.remove_path(&path).await
    }

    async fn reload(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let mut loaded = HashMap::new();
        for name in self.list_dir().await? {
            let path = self.settings.dir.join(&name);
            if name.ends_with(TMP_SUFFIX) {
                debug!(file = %name, "removing interrupted session write");
                if let Err(e) = self.remove_path(&path).await { warn!(file = %name, error = %e, "could not remove temp file"); }
                continue;
            }
            let Some(token) = name.strip_suffix(".json") else { continue };
            if !is_well_formed(token) { continue; }
            let session = match self.read_record(&path).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => { warn!(file = %name, error = %e, "skipping unreadable session record"); continue; }
            };
            if session.token != token {
                warn!(file = %name, "skipping session record stored under a foreign name");
                continue;
            }
            if session.is_live(now, self.duration) {
                loaded.insert(session.token.clone(), session);
            } else if let Err(e) = self.remove_path(&path).await {
                warn!(file = %name, error = %e, "could not remove expired session record");
            }
        }
        let count = loaded.len();
        *self.index.write() = loaded;
        Ok(count)
    }

    async fn io<T, F>(&self, fut: F) -> Result<T, SessionError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.settings.io_timeout, fut).await {
            Ok(res) => res.map_err(SessionError::from),
            Err(_) => Err(SessionError::Timeout(self.settings.io_timeout)),
        }
    }

    async fn gate_within_timeout(&self) -> Option<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.settings.io_timeout, self.write_gate.lock()).await.ok()
    }

    /// Persist `session` atomically. The write runs as its own task so that on
    /// timeout it can be followed to completion by [`reap_late_write`](Self::reap_late_write).
    async fn write_session(&self, session: &Session) -> Result<(), SessionError> {
        let bytes = serde_json::to_vec_pretty(session)?;
        let path = self.session_path(&session.token);
        let tmp = self.settings.dir.join(format!("{}{TMP_SUFFIX}", session.token));
        let mut write = tokio::spawn(write_atomically(tmp, path.clone(), bytes));
        match tokio::time::timeout(self.settings.io_timeout, &mut write).await {
            Ok(Ok(res)) => res.map_err(SessionError::from),
            Ok(Err(join)) => Err(SessionError::Io(std::io::Error::other(join))),
            Err(_) => {
                self.reap_late_write(session.token.clone(), path, write);
                Err(SessionError::Timeout(self.settings.io_timeout))
            }
        }
    }

    /// Wait for a timed-out write to land, then drop the record again if its
    /// token was retired in the meantime.
    fn reap_late_write(&self, token: SessionToken, path: PathBuf, write: JoinHandle<std::io::Result<()>>) {
        let retired = self.retired.clone();
        let gate = self.write_gate.clone();
        tokio::spawn(async move {
            let _ = write.await;
            let _gate = gate.lock().await;
            if !retired.read().contains_key(&token) { return; }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(token = short(&token), "removed session record written after revocation"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(token = short(&token), error = %e, "could not remove session record written after revocation"),
            }
        });
    }

    async fn read_record(&self, path: &Path) -> Result<Option<Session>, SessionError> {
        let bytes = self.io(async {
            match tokio::fs::read(path).await {
                Ok(b) => Ok(Some(b)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        }).await?;
        match bytes {
            Some(b) => Ok(Some(serde_json::from_slice(&b)?)),
            None => Ok(None),
        }
    }

    async fn remove_record(&self, token: &str) -> Result<bool, SessionError> {
        self.remove_path(&self.session_path(token)).await
    }

    async fn remove_path(&self, path: &Path) -> Result<bool, SessionError> {
        self.io(async {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        }).await
    }

    async fn list_dir(&self) -> Result<Vec<String>, SessionError> {
        let dir = self.settings.dir.clone();
        self.io(async move {
            let mut rd = tokio::fs::read_dir(&dir).await?;
            let mut out = Vec::new();
            while let Some(ent) = rd.next_entry().await? {
                out.push(ent.file_name().to_string_lossy().into_owned());
            }
            Ok(out)
        }).await
    }

    fn is_retired(&self, token: &str) -> bool { self.retired.read().contains_key(token) }

    fn retire(&self, token: &str) { self.retired.write().insert(token.to_string(), self.clock.now()); }

    /// Forget retired tokens once a full session duration has passed and their
    /// record is gone; by then nothing of theirs can still be live.
    fn prune_retired(&self, now: DateTime<Utc>, listed: &[String]) {
        let duration = self.duration;
        self.retired.write().retain(|token, at| {
            now - *at < duration || listed.iter().any(|n| n.strip_suffix(".json") == Some(token.as_str()))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ManualClock;
    use chrono::TimeZone;

    async fn store(dir: &Path) -> SessionStore {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()));
        let settings = SessionSettings::new(dir, StdDuration::from_secs(3600), StdDuration::from_secs(60));
        SessionStore::open(settings, clock).await.unwrap()
    }

    /// Stand-in for a write that outlived its timeout: it lands once `release`
    /// fires and reports on `landed` afterwards.
    fn held_write(path: PathBuf, bytes: Vec<u8>) -> (tokio::sync::oneshot::Sender<()>, tokio::sync::oneshot::Receiver<()>, JoinHandle<std::io::Result<()>>) {
        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let (landed_tx, landed) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = wait.await;
            let res = tokio::fs::write(&path, bytes).await;
            let _ = landed_tx.send(());
            res
        });
        (release, landed, handle)
    }

    async fn wait_gone(path: &Path) -> bool {
        for _ in 0..200 {
            if !path.exists() { return true; }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn late_write_after_delete_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path()).await;
        let token = store.create(&AuthUser::new(1, "Seneca")).await.unwrap();
        let path = store.session_path(&token);
        let record = tokio::fs::read(&path).await.unwrap();

        let (release, landed, handle) = held_write(path.clone(), record);
        store.reap_late_write(token.clone(), path.clone(), handle);

        assert!(store.delete(&token).await.unwrap());
        assert!(!path.exists());
        release.send(()).unwrap();
        landed.await.unwrap();
        assert!(wait_gone(&path).await, "record rewritten after delete must not survive");
    }

    #[tokio::test]
    async fn late_write_for_a_live_session_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path()).await;
        let token = store.create(&AuthUser::new(1, "Seneca")).await.unwrap();
        let path = store.session_path(&token);
        let record = tokio::fs::read(&path).await.unwrap();

        let (release, landed, handle) = held_write(path.clone(), record);
        store.reap_late_write(token.clone(), path.clone(), handle);
        release.send(()).unwrap();
        landed.await.unwrap();
        // Let the reaper run its check.
        for _ in 0..10 { tokio::task::yield_now().await; }
        let _gate = store.write_gate.lock().await;
        assert!(path.exists());
    }
}
