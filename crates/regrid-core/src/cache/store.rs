//! Filesystem-backed weight/area cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! weights/<k[..2]>/<k>.rgwa     promoted weight entries
//! areas/<k[..2]>/<k>.rgaa       promoted area entries
//! locks/<k>.lock                advisory per-key locks
//! tmp/<k>.<uuid>.partial        entries being written
//! failed/<k>.json               negative results with expiry
//! superseded/<k>.<ts>.rgwa      invalidated entries (stale fallbacks)
//! ```
//!
//! Entries are immutable: a file is written under `tmp/`, synced, re-read and
//! verified, then renamed into place. Only the renamed file is ever read.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::entry::{self, CacheEntryMeta};
use super::key::{CacheKey, EntryKind};
use super::lock::{Claim, FileLock, InFlight};
use super::memory::MemoryCache;
use super::negative::NegativeEntry;
use crate::config::RegridConfig;
use crate::error::{RegridContext, RegridError, Result};
use crate::generator::{WeightGenerator, WeightRequest};
use crate::grid::{GridRole, ResolvedGrid};
use crate::types::CacheStats;
use crate::weights::{AreaArtifact, WeightArtifact};

const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const FAILED_DIR: &str = "failed";
const SUPERSEDED_DIR: &str = "superseded";

/// Cache behaviour settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub negative_ttl: Duration,
    pub allow_stale: bool,
    pub memory_entries: usize,
    pub partial_max_age: Duration,
}

impl CacheSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            negative_ttl: Duration::from_secs(300),
            allow_stale: false,
            memory_entries: 32,
            partial_max_age: Duration::from_secs(24 * 3600),
        }
    }

    pub fn from_config(config: &RegridConfig) -> Self {
        Self {
            root: config.cache_root(),
            negative_ttl: Duration::from_secs(config.cache.negative_ttl_secs),
            allow_stale: config.cache.allow_stale,
            memory_entries: config.cache.memory_entries,
            partial_max_age: Duration::from_secs(config.cache.partial_max_age_secs),
        }
    }
}

/// A promoted (or unreadable) entry found by [`WeightCache::list`].
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub kind: EntryKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub meta: Option<CacheEntryMeta>,
    /// Why the header could not be read, if it could not.
    pub problem: Option<String>,
}

/// An entry written to `tmp/` but not yet visible.
///
/// Dropping it without [`StagedEntry::promote`] leaves the file behind, as a
/// crashed writer would; [`WeightCache::sweep_partials`] removes such files.
#[derive(Debug)]
pub struct StagedEntry {
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl StagedEntry {
    pub fn path(&self) -> &Path {
        &self.tmp_path
    }

    /// Atomically rename the entry into its final location.
    pub fn promote(self) -> Result<PathBuf> {
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(parent) = self.final_path.parent() {
            sync_dir(parent);
        }
        Ok(self.final_path)
    }

    fn discard(self) {
        let _ = fs::remove_file(&self.tmp_path);
    }
}

/// Persistent, content-addressed cache of weight and area artifacts.
///
/// Safe to share between threads and between processes using the same root.
/// For each key at most one computation runs at a time; other callers wait
/// for it and then read the promoted entry, or receive the same failure.
pub struct WeightCache {
    settings: CacheSettings,
    generator: Arc<dyn WeightGenerator>,
    memory: Mutex<MemoryCache>,
    in_flight: InFlight,
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
}

impl std::fmt::Debug for WeightCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightCache")
            .field("settings", &self.settings)
            .field("generator_version", &self.generator.version())
            .finish()
    }
}

impl WeightCache {
    /// Open (creating if needed) the cache directory.
    pub fn open(settings: CacheSettings, generator: Arc<dyn WeightGenerator>) -> Result<Self> {
        for dir in [
            EntryKind::Weights.dir_name(),
            EntryKind::Areas.dir_name(),
            LOCKS_DIR,
            TMP_DIR,
            FAILED_DIR,
            SUPERSEDED_DIR,
        ] {
            fs::create_dir_all(settings.root.join(dir)).map_err(|e| {
                RegridError::Storage(format!(
                    "cannot create cache directory {:?}: {}",
                    settings.root.join(dir),
                    e
                ))
            })?;
        }

        info!(
            root = %settings.root.display(),
            generator_version = %generator.version(),
            allow_stale = settings.allow_stale,
            "Opened weight cache"
        );

        Ok(Self {
            memory: Mutex::new(MemoryCache::new(settings.memory_entries)),
            settings,
            generator,
            in_flight: InFlight::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computations: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.settings.root
    }

    pub fn generator_version(&self) -> &str {
        self.generator.version()
    }

    pub fn key_for(&self, request: &WeightRequest) -> CacheKey {
        CacheKey::for_weights(request, self.generator.version())
    }

    /// Final location of an entry.
    pub fn entry_path(&self, key: &CacheKey, kind: EntryKind) -> PathBuf {
        self.settings
            .root
            .join(kind.dir_name())
            .join(key.shard())
            .join(format!("{}.{}", key, kind.extension()))
    }

    fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.settings.root.join(LOCKS_DIR).join(format!("{}.lock", key))
    }

    fn negative_path(&self, key: &CacheKey) -> PathBuf {
        self.settings.root.join(FAILED_DIR).join(format!("{}.json", key))
    }

    fn memory(&self) -> MutexGuard<'_, MemoryCache> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the weights for a request, computing them on a miss.
    ///
    /// Concurrent callers for the same key share one computation and all
    /// receive its result, including its failure.
    pub fn get_or_compute(&self, request: &WeightRequest) -> Result<Arc<WeightArtifact>> {
        let key = self.key_for(request);
        let context = request.context();

        if let Some(artifact) = self.load_or_discard(&key, &context)? {
            return Ok(artifact);
        }
        self.check_negative(&key, &context, None)?;

        let guard = loop {
            match self.in_flight.claim(key.as_str()) {
                Claim::Leader(guard) => break guard,
                Claim::Follower(waiter) => {
                    if let Some(stale) = self.stale_fallback(&key) {
                        return Ok(stale);
                    }
                    debug!(key = %key.short(), "Waiting for in-flight computation");
                    if let Some(outcome) = waiter.wait() {
                        if outcome.is_ok() {
                            self.hits.fetch_add(1, Ordering::Relaxed);
                        }
                        return outcome;
                    }
                }
            }
        };

        let outcome = self.lead(&key, request, &context);
        guard.finish(&outcome);
        outcome
    }

    fn lead(
        &self,
        key: &CacheKey,
        request: &WeightRequest,
        context: &RegridContext,
    ) -> Result<Arc<WeightArtifact>> {
        let lock_path = self.lock_path(key);
        let waiting_since = Utc::now();
        let (_file_lock, waited) = match FileLock::try_acquire(&lock_path)? {
            Some(lock) => (lock, false),
            None => {
                if let Some(stale) = self.stale_fallback(key) {
                    return Ok(stale);
                }
                debug!(key = %key.short(), "Waiting for computation in another process");
                (FileLock::acquire(&lock_path)?, true)
            }
        };

        // Whoever held the lock may have finished (or failed) meanwhile.
        if let Some(artifact) = self.load_or_discard(key, context)? {
            return Ok(artifact);
        }
        self.check_negative(key, context, waited.then_some(waiting_since))?;

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.compute_and_store(key, request, context)
    }

    fn compute_and_store(
        &self,
        key: &CacheKey,
        request: &WeightRequest,
        context: &RegridContext,
    ) -> Result<Arc<WeightArtifact>> {
        self.computations.fetch_add(1, Ordering::Relaxed);
        info!(key = %key.short(), %context, "Computing weights");

        let generated = match self.generator.compute(request) {
            Ok(generated) => generated,
            Err(err) => {
                self.record_failure(key, context, &err);
                return Err(err);
            }
        };

        if let Err(reason) = generated.weights.check_invariants() {
            let err = RegridError::weight_generation(
                context,
                format!("generator returned invalid weights: {}", reason),
            );
            self.record_failure(key, context, &err);
            return Err(err);
        }

        let bytes = entry::encode_weights(key, request, self.generator.version(), &generated.weights);
        let staged = self.stage(key, EntryKind::Weights, &bytes)?;
        let reread = fs::read(staged.path())?;
        if let Err(reason) = entry::decode_weights(&reread) {
            let path = staged.path().to_path_buf();
            staged.discard();
            return Err(RegridError::CacheCorruption {
                context: Box::new(context.clone()),
                path,
                reason,
            });
        }
        let path = staged.promote()?;

        for area in [&generated.source_area, &generated.target_area] {
            if let Err(e) = self.store_areas(area) {
                warn!(error = %e, grid = %area.grid_digest, "Failed to persist cell areas");
            }
        }

        info!(
            key = %key.short(),
            path = %path.display(),
            nnz = generated.weights.nnz(),
            "Promoted weight entry"
        );

        let artifact = Arc::new(generated.weights);
        self.memory().insert(key.clone(), Arc::clone(&artifact));
        Ok(artifact)
    }

    /// Write bytes under `tmp/` and sync them, without making them visible.
    pub fn stage(&self, key: &CacheKey, kind: EntryKind, bytes: &[u8]) -> Result<StagedEntry> {
        let tmp_path = self.settings.root.join(TMP_DIR).join(format!(
            "{}.{}.partial",
            key,
            uuid::Uuid::new_v4().simple()
        ));
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        Ok(StagedEntry {
            tmp_path,
            final_path: self.entry_path(key, kind),
        })
    }

    /// Stage the weights a generator would produce for `request`.
    pub fn stage_weights(
        &self,
        request: &WeightRequest,
        artifact: &WeightArtifact,
    ) -> Result<StagedEntry> {
        let key = self.key_for(request);
        let bytes = entry::encode_weights(&key, request, self.generator.version(), artifact);
        self.stage(&key, EntryKind::Weights, &bytes)
    }

    /// Persist a generator failure.
    ///
    /// Written even with a zero TTL: a caller in another process that waited
    /// on the lock still picks it up, while later callers treat it as expired.
    fn record_failure(&self, key: &CacheKey, context: &RegridContext, err: &RegridError) {
        let RegridError::WeightGeneration { message, .. } = err else {
            return;
        };
        let negative = NegativeEntry::new(
            key,
            message,
            context.to_string(),
            self.settings.negative_ttl,
        );
        match negative.store(&self.negative_path(key)) {
            Ok(()) => warn!(
                key = %key.short(),
                ttl_secs = self.settings.negative_ttl.as_secs(),
                error = %message,
                "Recorded failed weight computation"
            ),
            Err(e) => warn!(error = %e, "Failed to record negative cache entry"),
        }
    }

    /// Fail with a recorded failure that is still live.
    ///
    /// With `waited_since`, a record written after that instant also counts
    /// even if expired: it is the outcome of the computation the caller
    /// waited on.
    fn check_negative(
        &self,
        key: &CacheKey,
        context: &RegridContext,
        waited_since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let Some(negative) = NegativeEntry::read(&self.negative_path(key))? else {
            return Ok(());
        };
        let from_holder = waited_since.is_some_and(|since| negative.created_at >= since);
        if negative.is_expired() && !from_holder {
            return Ok(());
        }
        warn!(
            key = %key.short(),
            expires_at = %negative.expires_at,
            "Returning cached weight generation failure"
        );
        Err(RegridError::weight_generation(context, negative.message))
    }

    /// Memory, then disk. A corrupt disk entry is removed and reported as absent.
    fn load_or_discard(
        &self,
        key: &CacheKey,
        context: &RegridContext,
    ) -> Result<Option<Arc<WeightArtifact>>> {
        match self.load(key, context) {
            Ok(found) => Ok(found),
            Err(RegridError::CacheCorruption { path, reason, .. }) => {
                warn!(
                    key = %key.short(),
                    path = %path.display(),
                    reason = %reason,
                    "Discarding corrupt cache entry"
                );
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn load(&self, key: &CacheKey, context: &RegridContext) -> Result<Option<Arc<WeightArtifact>>> {
        if let Some(artifact) = self.memory().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.short(), "Weight cache hit (memory)");
            return Ok(Some(artifact));
        }

        let path = self.entry_path(key, EntryKind::Weights);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (_, artifact) =
            entry::decode_weights(&bytes).map_err(|reason| RegridError::CacheCorruption {
                context: Box::new(context.clone()),
                path: path.clone(),
                reason,
            })?;

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key.short(), "Weight cache hit (disk)");
        let artifact = Arc::new(artifact);
        self.memory().insert(key.clone(), Arc::clone(&artifact));
        Ok(Some(artifact))
    }

    /// Look up a promoted entry without computing.
    ///
    /// A corrupt entry is reported as `CacheCorruption`.
    pub fn lookup(&self, request: &WeightRequest) -> Result<Option<Arc<WeightArtifact>>> {
        self.load(&self.key_for(request), &request.context())
    }

    fn stale_fallback(&self, key: &CacheKey) -> Option<Arc<WeightArtifact>> {
        if !self.settings.allow_stale {
            return None;
        }
        let prefix = format!("{}.", key);
        let mut candidates: Vec<PathBuf> = fs::read_dir(self.settings.root.join(SUPERSEDED_DIR))
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();

        for path in candidates.into_iter().rev() {
            let decoded = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| entry::decode_weights(&bytes));
            match decoded {
                Ok((meta, artifact)) => {
                    warn!(
                        key = %key.short(),
                        created_at = %meta.created_at,
                        "Serving superseded weights while another caller computes"
                    );
                    return Some(Arc::new(artifact));
                }
                Err(reason) => debug!(path = %path.display(), %reason, "Skipping unusable stale entry"),
            }
        }
        None
    }

    /// Remove the entry and any negative result for a request.
    ///
    /// The entry is moved to `superseded/`. Returns whether an entry existed.
    pub fn invalidate(&self, request: &WeightRequest) -> Result<bool> {
        let key = self.key_for(request);
        let _lock = FileLock::acquire(&self.lock_path(&key))?;

        self.memory().remove(&key);
        let cleared_negative = NegativeEntry::remove(&self.negative_path(&key))?;

        let path = self.entry_path(&key, EntryKind::Weights);
        let superseded = self.settings.root.join(SUPERSEDED_DIR).join(format!(
            "{}.{}.{}",
            key,
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            EntryKind::Weights.extension()
        ));
        let existed = match fs::rename(&path, &superseded) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        info!(
            key = %key.short(),
            existed,
            cleared_negative,
            "Invalidated weight entry"
        );
        Ok(existed)
    }

    /// Invalidate and recompute.
    pub fn rebuild(&self, request: &WeightRequest) -> Result<Arc<WeightArtifact>> {
        self.invalidate(request)?;
        self.get_or_compute(request)
    }

    /// Structural check of the stored entry, without recomputing.
    ///
    /// A missing entry fails verification.
    pub fn verify(&self, request: &WeightRequest) -> Result<bool> {
        let key = self.key_for(request);
        let path = self.entry_path(&key, EntryKind::Weights);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match entry::decode_weights(&bytes) {
            Ok(_) => Ok(true),
            Err(reason) => {
                warn!(key = %key.short(), path = %path.display(), %reason, "Cache entry failed verification");
                Ok(false)
            }
        }
    }

    fn store_areas(&self, area: &AreaArtifact) -> Result<()> {
        let key = CacheKey::for_areas(&area.grid_digest, &area.role, self.generator.version());
        if self.entry_path(&key, EntryKind::Areas).exists() {
            return Ok(());
        }
        area.check_invariants().map_err(RegridError::Metadata)?;
        let bytes = entry::encode_areas(&key, self.generator.version(), area);
        self.stage(&key, EntryKind::Areas, &bytes)?.promote()?;
        Ok(())
    }

    /// Cell areas of one grid file, if any computation has produced them.
    pub fn areas_for(&self, grid: &ResolvedGrid, role: &GridRole) -> Result<Option<AreaArtifact>> {
        let key = CacheKey::for_areas(&grid.digest(), role, self.generator.version());
        let path = self.entry_path(&key, EntryKind::Areas);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match entry::decode_areas(&bytes) {
            Ok((_, area)) => Ok(Some(area)),
            Err(reason) => {
                warn!(path = %path.display(), %reason, "Discarding corrupt area entry");
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// All promoted entries, with their headers where readable.
    pub fn list(&self) -> Result<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        for kind in [EntryKind::Weights, EntryKind::Areas] {
            let dir = self.settings.root.join(kind.dir_name());
            for item in WalkDir::new(&dir).min_depth(2).max_depth(2).sort_by_file_name() {
                let item = item.map_err(|e| RegridError::Storage(e.to_string()))?;
                let path = item.path();
                if path.extension().and_then(|e| e.to_str()) != Some(kind.extension()) {
                    continue;
                }
                let size_bytes = item.metadata().map(|m| m.len()).unwrap_or(0);
                let (meta, problem) = match fs::read(path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| entry::read_meta(&bytes, kind))
                {
                    Ok(meta) => (Some(meta), None),
                    Err(reason) => (None, Some(reason)),
                };
                entries.push(EntryInfo {
                    kind,
                    path: path.to_path_buf(),
                    size_bytes,
                    meta,
                    problem,
                });
            }
        }
        Ok(entries)
    }

    /// Remove temporary files older than `max_age` and expired negative results.
    ///
    /// Returns the number of files removed.
    pub fn sweep_partials(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for item in fs::read_dir(self.settings.root.join(TMP_DIR))? {
            let path = item?.path();
            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or_default();
            if age >= max_age {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for item in fs::read_dir(self.settings.root.join(FAILED_DIR))? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if NegativeEntry::load(&path)?.is_none() && NegativeEntry::remove(&path)? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Swept orphaned cache files");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.memory();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: memory.len(),
            computations: self.computations.load(Ordering::Relaxed),
            evictions: memory.evictions(),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratedWeights;
    use crate::grid::{GridSignature, RegularGrid};
    use crate::types::{MaskVariant, Method};
    use crate::weights::{LevelWeights, SparseWeights};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Identity weights between two equal-sized regular grids.
    struct IdentityGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    impl IdentityGenerator {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl WeightGenerator for IdentityGenerator {
        fn version(&self) -> &str {
            "identity-1"
        }

        fn compute(&self, request: &WeightRequest) -> Result<GeneratedWeights> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RegridError::weight_generation(&request.context(), "grid file unreadable"));
            }
            let grid = request.source.as_regular().unwrap_or(RegularGrid::new(1, 1));
            let area = |digest: String| AreaArtifact {
                grid_digest: digest,
                role: GridRole::Unmasked,
                shape: grid.shape(),
                areas: vec![1.0; grid.size()],
            };
            Ok(GeneratedWeights {
                weights: WeightArtifact {
                    source: request.source.signature.clone(),
                    target: request.target.signature.clone(),
                    method: request.method,
                    mask_variant: request.mask_variant,
                    src_shape: grid.shape(),
                    dst_shape: grid.shape(),
                    weights: LevelWeights::Uniform(SparseWeights::identity(grid.size())),
                },
                source_area: area(request.source.digest()),
                target_area: area(request.target.digest()),
            })
        }
    }

    fn request() -> WeightRequest {
        let grid = GridSignature::regular(&RegularGrid::new(4, 2));
        WeightRequest::new(
            ResolvedGrid::new("r4x2", grid.clone()),
            ResolvedGrid::new("r4x2", grid),
            Method::Conservative,
            MaskVariant::Unmasked,
        )
    }

    #[test]
    fn test_compute_once_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(false);
        let cache = WeightCache::open(CacheSettings::new(dir.path()), gen.clone()).unwrap();

        assert!(cache.lookup(&request()).unwrap().is_none());
        let first = cache.get_or_compute(&request()).unwrap();
        let second = cache.get_or_compute(&request()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);
        assert!(cache.verify(&request()).unwrap());

        let key = cache.key_for(&request());
        assert!(cache.entry_path(&key, EntryKind::Weights).exists());

        let stats = cache.stats();
        assert_eq!(stats.computations, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_reopened_cache_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(false);
        {
            let cache = WeightCache::open(CacheSettings::new(dir.path()), gen.clone()).unwrap();
            cache.get_or_compute(&request()).unwrap();
        }
        let cache = WeightCache::open(CacheSettings::new(dir.path()), gen.clone()).unwrap();
        cache.get_or_compute(&request()).unwrap();
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);

        let grid = request().source;
        let areas = cache.areas_for(&grid, &GridRole::Unmasked).unwrap().unwrap();
        assert_eq!(areas.areas.len(), 8);
    }

    #[test]
    fn test_failure_is_cached_then_cleared_by_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(true);
        let cache = WeightCache::open(CacheSettings::new(dir.path()), gen.clone()).unwrap();

        let first = cache.get_or_compute(&request()).unwrap_err();
        let second = cache.get_or_compute(&request()).unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);
        assert!(!cache.verify(&request()).unwrap());

        assert!(!cache.invalidate(&request()).unwrap());
        assert!(cache.get_or_compute(&request()).is_err());
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_corrupt_entry_is_recomputed_once() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(false);
        let cache = WeightCache::open(CacheSettings::new(dir.path()), gen.clone()).unwrap();
        cache.get_or_compute(&request()).unwrap();

        let key = cache.key_for(&request());
        let path = cache.entry_path(&key, EntryKind::Weights);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x5a;
        fs::write(&path, bytes).unwrap();

        assert!(!cache.verify(&request()).unwrap());
        let reopened = WeightCache::open(CacheSettings::new(dir.path()), gen.clone()).unwrap();
        assert!(matches!(
            reopened.lookup(&request()),
            Err(RegridError::CacheCorruption { .. })
        ));
        reopened.get_or_compute(&request()).unwrap();
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
        assert!(reopened.verify(&request()).unwrap());
    }

    #[test]
    fn test_invalidate_supersedes_and_rebuild_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(false);
        let cache = WeightCache::open(CacheSettings::new(dir.path()), gen.clone()).unwrap();
        cache.get_or_compute(&request()).unwrap();

        assert!(cache.invalidate(&request()).unwrap());
        assert!(cache.lookup(&request()).unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path().join(SUPERSEDED_DIR)).unwrap().count(), 1);

        cache.rebuild(&request()).unwrap();
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read_dir(dir.path().join(SUPERSEDED_DIR)).unwrap().count(), 1);
        assert!(cache.verify(&request()).unwrap());
    }

    #[test]
    fn test_stale_entry_served_while_locked_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(false);
        let mut settings = CacheSettings::new(dir.path());
        settings.allow_stale = true;
        let cache = WeightCache::open(settings, gen.clone()).unwrap();
        cache.get_or_compute(&request()).unwrap();
        cache.invalidate(&request()).unwrap();

        let key = cache.key_for(&request());
        let _held = FileLock::acquire(&cache.lock_path(&key)).unwrap();
        let stale = cache.get_or_compute(&request()).unwrap();
        assert_eq!(stale.n_dst(), 8);
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_waiter_gets_failure_with_zero_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(false);
        let mut settings = CacheSettings::new(dir.path());
        settings.negative_ttl = Duration::ZERO;
        let cache = WeightCache::open(settings.clone(), gen.clone()).unwrap();
        // Stands in for another process computing the same key.
        let holder = WeightCache::open(settings, gen.clone()).unwrap();
        let key = cache.key_for(&request());
        let context = request().context();

        let held = FileLock::acquire(&holder.lock_path(&key)).unwrap();
        let result = thread::scope(|s| {
            let waiter = s.spawn(|| cache.get_or_compute(&request()));
            thread::sleep(Duration::from_millis(100));
            let failure = RegridError::weight_generation(&context, "grid file unreadable");
            holder.record_failure(&key, &context, &failure);
            drop(held);
            waiter.join().unwrap()
        });
        match result {
            Err(RegridError::WeightGeneration { message, .. }) => {
                assert_eq!(message, "grid file unreadable")
            }
            other => panic!("unexpected result {:?}", other.map(|a| a.nnz())),
        }
        assert_eq!(gen.calls.load(Ordering::SeqCst), 0);

        // The record has expired for callers that did not wait on it.
        cache.get_or_compute(&request()).unwrap();
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_list_and_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let gen = IdentityGenerator::new(false);
        let cache = WeightCache::open(CacheSettings::new(dir.path()), gen).unwrap();
        cache.get_or_compute(&request()).unwrap();

        let entries = cache.list().unwrap();
        assert_eq!(entries.iter().filter(|e| e.kind == EntryKind::Weights).count(), 1);
        // Source and target are the same grid, so one area entry.
        assert_eq!(entries.iter().filter(|e| e.kind == EntryKind::Areas).count(), 1);
        assert!(entries.iter().all(|e| e.meta.is_some()));

        let key = cache.key_for(&request());
        let staged = cache.stage(&key, EntryKind::Weights, b"half-written").unwrap();
        assert!(staged.path().exists());
        assert_eq!(cache.sweep_partials(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(cache.sweep_partials(Duration::ZERO).unwrap(), 1);
    }
}
