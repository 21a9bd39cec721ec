//! Genesis: the self-extension pipeline.
//!
//! Three tools move a plugin from source text to registered tools:
//!
//! 1. [`tools::write_file`] - validate + guard-scan source, write it under
//!    the sandboxed source root, mark DS6 stage `WROTE`
//! 2. [`tools::compile_shared`] - re-guard, compile to a position-independent
//!    shared object with a restricted flag set, record its SHA-256 in the
//!    DS6 stage `COMPILED`
//! 3. [`tools::load_plugin`] - re-hash the object, constant-time compare
//!    against the recorded hash, check ABI version and capability mask, and
//!    register the plugin's tools (in-proc via dlopen, or out-of-proc via a
//!    toolhost session pool)
//!
//! Everything Genesis needs from the host travels in a [`HostServices`]
//! value passed explicitly into each tool call - registry writer handle,
//! plugin manager, tool runner, workspace root. No globals, no back-pointers
//! from descriptors to the registry.

pub mod abi;
pub mod breaker;
pub mod guard;
pub mod loader;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use breaker::GenesisBreaker;
pub use loader::PluginManager;

use crate::executor::{IsolationPolicy, Runner, TierIsolation};
use crate::registry::SharedRegistry;

/// AID of the source-writing stage tool.
pub const AID_WRITE_FILE: &str = "AID.GENESIS.WRITE_FILE.v1";
/// AID of the compile stage tool.
pub const AID_COMPILE_SHARED: &str = "AID.GENESIS.COMPILE_SHARED.v1";
/// AID of the load stage tool.
pub const AID_LOAD_PLUGIN: &str = "AID.GENESIS.LOAD_PLUGIN.v1";

/// DS6 stage marker after a successful write.
pub const STAGE_WROTE: &str = "WROTE";
/// DS6 stage marker after a successful compile.
pub const STAGE_COMPILED: &str = "COMPILED";
/// DS6 stage marker after a successful load.
pub const STAGE_LOADED: &str = "LOADED";

/// Workspace slot carrying the Genesis stage marker.
pub const STAGE_SLOT: u8 = 6;
/// Workspace slot carrying the per-stage result artifact.
pub const RESULT_SLOT: u8 = 7;

/// Errors from Genesis operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GenesisError {
    /// A path escaped its sandbox base or contained `..`.
    #[error("path escapes sandbox base: {path}")]
    PathEscape {
        /// The offending path.
        path: String,
    },

    /// The guard rejected the source.
    #[error("{0}")]
    GuardViolation(String),

    /// The plugin failed a load-time check.
    #[error("plugin load rejected: {reason}")]
    LoadRejected {
        /// Why the load was refused.
        reason: String,
    },

    /// Filesystem failure.
    #[error("genesis I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Genesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Master switch; everything refuses when off.
    pub enabled: bool,
    /// Production hardening: stricter source caps, mandatory ABI export.
    pub prod_mode: bool,
    /// Whether the source guard runs. Bypassable for dev only; prod mode
    /// forces it on.
    pub guard_enabled: bool,
    /// Compiler override; autodetected (`g++` then `clang++`) when empty.
    pub compiler: String,
    /// Run `clang-tidy` over the source before compiling.
    pub clang_tidy: bool,
    /// Treat an analyzer that cannot start as a compile failure.
    pub clang_tidy_strict: bool,
    /// Source size cap in bytes.
    pub max_source_bytes: usize,
    /// Prod-mode source size cap in bytes.
    pub prod_max_source_bytes: usize,
    /// Compile subprocess timeout.
    #[serde(with = "humantime_serde")]
    pub compile_timeout: Duration,
    /// Load plugins out-of-proc through a toolhost pool instead of dlopen.
    pub oop_mode: bool,
    /// Toolhost binary for out-of-proc mode.
    pub toolhost_bin: PathBuf,
    /// Sessions per out-of-proc plugin pool.
    pub pool_size: usize,
    /// Accept plugins without an ABI version export (dev only).
    pub abi_lax: bool,
    /// Capability mask plugins may request.
    pub allowed_caps: u32,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prod_mode: false,
            guard_enabled: true,
            compiler: String::new(),
            clang_tidy: false,
            clang_tidy_strict: false,
            max_source_bytes: 256 * 1024,
            prod_max_source_bytes: 32 * 1024,
            compile_timeout: Duration::from_secs(30),
            oop_mode: false,
            toolhost_bin: PathBuf::from("machina-host"),
            pool_size: 2,
            abi_lax: false,
            allowed_caps: abi::caps::ALL,
        }
    }
}

impl GenesisConfig {
    /// Whether the guard actually runs: prod mode cannot switch it off.
    #[must_use]
    pub fn guard_active(&self) -> bool {
        self.guard_enabled || self.prod_mode
    }
}

/// The context value handed to every Genesis tool call.
///
/// Breaks the Genesis↔plugin↔registry ownership cycle: tools reach the
/// registry and runner only through this explicitly-passed handle.
pub struct HostServices {
    /// Registry writer handle.
    pub registry: SharedRegistry,
    /// In-proc tool dispatcher; plugin tools register here.
    pub runner: Arc<Runner>,
    /// Plugin manager (dlopen bookkeeping + expected hashes).
    pub plugins: Mutex<PluginManager>,
    /// Workspace root; Genesis paths live under it.
    pub root: PathBuf,
    /// Genesis configuration.
    pub config: GenesisConfig,
    /// Decides which loaded tools route out-of-proc.
    pub isolation: Arc<dyn IsolationPolicy>,
    /// Allow plugin re-registration to override existing AIDs.
    pub allow_override: bool,
}

impl HostServices {
    /// Builds host services rooted at `root` with default isolation.
    #[must_use]
    pub fn new(registry: SharedRegistry, runner: Arc<Runner>, root: impl Into<PathBuf>, config: GenesisConfig) -> Self {
        let config_caps = config.allowed_caps;
        Self {
            registry,
            runner,
            plugins: Mutex::new(PluginManager::new(config_caps, config.abi_lax)),
            root: root.into(),
            config,
            isolation: Arc::new(TierIsolation),
            allow_override: false,
        }
    }

    /// Sandboxed source root: `<root>/runtime_genesis/src`.
    #[must_use]
    pub fn source_root(&self) -> PathBuf {
        self.root.join("runtime_genesis").join("src")
    }

    /// Compiled plugin root: `<root>/runtime_plugins`.
    #[must_use]
    pub fn plugin_root(&self) -> PathBuf {
        self.root.join("runtime_plugins")
    }

    /// Circuit-breaker state dir: `<root>/runtime_genesis/breakers`.
    #[must_use]
    pub fn breaker_root(&self) -> PathBuf {
        self.root.join("runtime_genesis").join("breakers")
    }
}

/// Resolves `rel` under `base`, rejecting traversal out of the sandbox.
///
/// # Errors
///
/// Returns [`GenesisError::PathEscape`] when the joined path does not stay
/// under `base`.
pub fn ensure_under(base: &Path, rel: &str) -> Result<PathBuf, GenesisError> {
    let escape = || GenesisError::PathEscape {
        path: rel.to_string(),
    };
    if rel.contains("..") || rel.starts_with('/') {
        return Err(escape());
    }
    let joined = base.join(rel);
    // Canonicalize what exists; the final component may not yet.
    let base_canonical = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let parent = joined.parent().unwrap_or(base);
    let parent_canonical = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
    let resolved = match joined.file_name() {
        Some(name) => parent_canonical.join(name),
        None => parent_canonical,
    };
    // Compare against both spellings of the base; partially-created trees
    // mix canonical and raw prefixes.
    if !resolved.starts_with(&base_canonical) && !resolved.starts_with(base) {
        return Err(escape());
    }
    Ok(resolved)
}

/// The platform's shared-object extension.
#[must_use]
pub fn dynlib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(windows) {
        ".dll"
    } else {
        ".so"
    }
}
