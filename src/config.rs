//! Backends are configured with a [`BackendBuilder`].  Every knob has
//! a default, so the minimal disk cache is
//! `BackendBuilder::new().path(dir).build()`.
use derivative::Derivative;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::error::Error;
use crate::error::Result;
use crate::eviction::EvictionMode;
use crate::size::SizePolicy;

/// What the cache holds.  Some types tune how entries are ranked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// The regular HTTP cache.
    Disk,
    /// Application cache: reads don't promote entries, and opening an
    /// entry doesn't mark it dirty.
    App,
    /// Compiled shaders: reads don't promote entries.
    Shader,
    /// An in-memory HTTP cache.
    Memory,
    GeneratedByteCode,
    GeneratedNativeCode,
}

impl Default for CacheType {
    fn default() -> CacheType {
        CacheType::Disk
    }
}

impl CacheType {
    /// Whether reading an entry moves it to the head of its list.
    pub(crate) fn reorders_on_read(self) -> bool {
        !matches!(self, CacheType::App | CacheType::Shader)
    }

    /// Whether opening an entry (rather than writing to it) marks it
    /// dirty on disk.
    pub(crate) fn dirties_on_open(self) -> bool {
        self != CacheType::App
    }
}

/// The storage engine behind a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Memory for [`CacheType::Memory`], simple otherwise.
    Default,
    /// Entries packed in shared block files.
    Blockfile,
    /// One file per entry stream.
    Simple,
    /// No persistence at all.
    Memory,
}

impl Default for BackendKind {
    fn default() -> BackendKind {
        BackendKind::Default
    }
}

impl BackendKind {
    fn resolve(self, cache_type: CacheType) -> BackendKind {
        match (self, cache_type) {
            (BackendKind::Default, CacheType::Memory) => BackendKind::Memory,
            (BackendKind::Default, _) => BackendKind::Simple,
            (kind, _) => kind,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            BackendKind::Default => "default",
            BackendKind::Blockfile => "blockfile",
            BackendKind::Simple => "simple",
            BackendKind::Memory => "memory",
        }
    }

    /// Blockfile and memory track sizes in 32-bit fields.
    pub(crate) fn accepts_max_size(self, max_size: u64) -> bool {
        match self {
            BackendKind::Blockfile | BackendKind::Memory => max_size <= i32::MAX as u64,
            BackendKind::Default | BackendKind::Simple => true,
        }
    }
}

/// What to do when the persisted state of a disk cache is unusable at
/// startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResetHandling {
    /// Fail `build()`.
    NeverReset,
    /// Delete everything and start empty.
    ResetOnError,
    /// Salvage what the entry files still describe.
    Recover,
}

impl Default for ResetHandling {
    fn default() -> ResetHandling {
        ResetHandling::ResetOnError
    }
}

pub(crate) const DEFAULT_MAX_OPEN_FILES: usize = 64;
pub(crate) const DEFAULT_WRITEBACK_PERIOD: u64 = 1000;

/// The validated configuration a backend runs with.
#[derive(Debug)]
pub(crate) struct Config {
    pub cache_type: CacheType,
    /// Never [`BackendKind::Default`].
    pub kind: BackendKind,
    /// Empty for the memory backend.
    pub path: PathBuf,
    /// 0 means pick a size automatically.
    pub max_size: u64,
    pub reset_handling: ResetHandling,
    pub eviction: EvictionMode,
    pub clock: Arc<dyn Clock>,
    pub max_open_files: usize,
    pub worker_threads: usize,
    pub size_policy: SizePolicy,
    pub index_writeback_period: u64,
}

/// Construct a [`Backend`] with this builder.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BackendBuilder {
    cache_type: CacheType,
    kind: BackendKind,
    path: Option<PathBuf>,
    max_size: u64,
    reset_handling: ResetHandling,
    eviction: EvictionMode,
    clock: Arc<dyn Clock>,
    max_open_files: usize,
    worker_threads: usize,
    size_policy: SizePolicy,
    index_writeback_period: u64,
    #[derivative(Debug = "ignore")]
    post_cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for BackendBuilder {
    fn default() -> BackendBuilder {
        BackendBuilder {
            cache_type: CacheType::default(),
            kind: BackendKind::default(),
            path: None,
            max_size: 0,
            reset_handling: ResetHandling::default(),
            eviction: EvictionMode::default(),
            clock: Arc::new(SystemClock),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            worker_threads: 1,
            size_policy: SizePolicy::default(),
            index_writeback_period: DEFAULT_WRITEBACK_PERIOD,
            post_cleanup: None,
        }
    }
}

impl BackendBuilder {
    /// Returns a fresh builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }

    pub fn kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the cache directory.  Required for disk backends, ignored
    /// by the memory backend.  The directory is created if needed.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_owned());
        self
    }

    /// Sets the maximum total size, in bytes.  0 (the default) picks
    /// a size from the free disk space, or 10 MiB in memory.
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn reset_handling(mut self, reset_handling: ResetHandling) -> Self {
        self.reset_handling = reset_handling;
        self
    }

    pub fn eviction(mut self, eviction: EvictionMode) -> Self {
        self.eviction = eviction;
        self
    }

    /// Sets the source of entry timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Caps the number of entry files the simple backend keeps open
    /// at once.  Defaults to 64.
    pub fn max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    /// Sets the number of threads that run disk operations.  Defaults
    /// to 1.  The memory backend never uses threads.
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn size_policy(mut self, size_policy: SizePolicy) -> Self {
        self.size_policy = size_policy;
        self
    }

    /// Writes back the index snapshot roughly every `period`
    /// mutations, in addition to clean shutdowns and explicit flushes.
    pub fn index_writeback_period(mut self, period: u64) -> Self {
        self.index_writeback_period = period;
        self
    }

    /// Registers a callback that runs once the backend and all its
    /// entries are gone, and its files are closed.
    pub fn post_cleanup(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.post_cleanup = Some(Box::new(callback));
        self
    }

    /// Validates the configuration and opens the backend, loading or
    /// recovering whatever state is on disk.
    pub fn build(self) -> Result<Backend> {
        let kind = self.kind.resolve(self.cache_type);
        if !kind.accepts_max_size(self.max_size) {
            return Err(Error::InvalidArgument("max_size is too large for this backend"));
        }

        let path = match (kind, self.path) {
            (BackendKind::Memory, _) => PathBuf::new(),
            (_, Some(path)) => path,
            (_, None) => return Err(Error::InvalidArgument("disk backends need a path")),
        };

        let config = Config {
            cache_type: self.cache_type,
            kind,
            path,
            max_size: self.max_size,
            reset_handling: self.reset_handling,
            eviction: self.eviction,
            clock: self.clock,
            max_open_files: self.max_open_files.max(1),
            worker_threads: self.worker_threads.max(1),
            size_policy: self.size_policy,
            index_writeback_period: self.index_writeback_period,
        };

        Backend::open(config, self.post_cleanup)
    }
}

#[test]
fn test_kind_resolution() {
    assert_eq!(
        BackendKind::Default.resolve(CacheType::Memory),
        BackendKind::Memory
    );
    assert_eq!(
        BackendKind::Default.resolve(CacheType::Disk),
        BackendKind::Simple
    );
    assert_eq!(
        BackendKind::Blockfile.resolve(CacheType::App),
        BackendKind::Blockfile
    );
}

#[test]
fn test_cache_type_tuning() {
    assert!(CacheType::Disk.reorders_on_read());
    assert!(!CacheType::App.reorders_on_read());
    assert!(!CacheType::Shader.reorders_on_read());
    assert!(CacheType::Shader.dirties_on_open());
    assert!(!CacheType::App.dirties_on_open());
}

#[test]
fn test_build_validation() {
    let too_big = i32::MAX as u64 + 1;

    let result = BackendBuilder::new()
        .cache_type(CacheType::Memory)
        .max_size(too_big)
        .build();
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let result = BackendBuilder::new().kind(BackendKind::Blockfile).build();
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let result = BackendBuilder::new()
        .kind(BackendKind::Memory)
        .max_size(i32::MAX as u64)
        .build();
    assert!(result.is_ok());
}
