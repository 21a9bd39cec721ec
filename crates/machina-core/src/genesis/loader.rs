//! In-process plugin loading: dlopen, verification, registration.
//!
//! Load order is deliberate: hash verification happens before the object is
//! mapped, then the ABI version check, then the capability mask check, and
//! only then does the init export run. Any rejection dlcloses immediately
//! and the plugin's tools never reach the registry.
//!
//! Loaded libraries are kept alive for the life of the manager; registered
//! tool closures hold raw entry points into them, so unloading would be
//! unsound. This mirrors the no-hot-unload posture of the ABI (there is no
//! deregistration path).

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use super::abi::{
    self, MachinaRegistrar, PluginAbiVersionFn, PluginCapabilitiesFn, PluginFreeFn, PluginInitFn,
    PluginToolFn, PluginToolResponse,
};
use super::GenesisError;
use crate::executor::{Runner, ToolFn, ToolResult};
use crate::hash::{constant_time_eq, sha256_hex_file};
use crate::registry::{SharedRegistry, ToolDesc};
use crate::types::StepStatus;
use crate::workspace::Workspace;

/// Tracks loaded plugins, their handles, and expected hashes.
pub struct PluginManager {
    libraries: Vec<(String, Library)>,
    loaded: HashSet<String>,
    expected_hashes: HashMap<String, String>,
    allowed_caps: u32,
    abi_lax: bool,
}

struct CollectedTool {
    desc: ToolDesc,
    entry: PluginToolFn,
}

struct CollectorCtx {
    tools: Vec<CollectedTool>,
}

unsafe extern "C" fn collect_tool(
    ctx: *mut std::os::raw::c_void,
    desc_json: *const std::os::raw::c_char,
    tool: PluginToolFn,
) {
    if ctx.is_null() || desc_json.is_null() {
        return;
    }
    let collector = &mut *ctx.cast::<CollectorCtx>();
    let Ok(text) = CStr::from_ptr(desc_json).to_str() else {
        return;
    };
    let Ok(desc) = serde_json::from_str::<ToolDesc>(text) else {
        return;
    };
    if desc.aid.is_empty() {
        return;
    }
    collector.tools.push(CollectedTool { desc, entry: tool });
}

impl PluginManager {
    /// Creates a manager enforcing `allowed_caps`; `abi_lax` accepts
    /// plugins without the version export (dev only).
    #[must_use]
    pub fn new(allowed_caps: u32, abi_lax: bool) -> Self {
        Self {
            libraries: Vec::new(),
            loaded: HashSet::new(),
            expected_hashes: HashMap::new(),
            allowed_caps,
            abi_lax,
        }
    }

    fn canonical_key(path: &Path) -> String {
        path.canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }

    /// Whether `path` is already loaded.
    #[must_use]
    pub fn is_loaded(&self, path: &Path) -> bool {
        self.loaded.contains(&Self::canonical_key(path))
    }

    /// Pins the expected SHA-256 for a plugin path; the next load verifies
    /// against it in constant time.
    pub fn set_expected_hash(&mut self, path: &Path, sha256_hex: impl Into<String>) {
        self.expected_hashes
            .insert(Self::canonical_key(path), sha256_hex.into());
    }

    /// Loads one plugin and registers its tools into `registry` and
    /// `runner`. Returns the number of tools registered (zero for an
    /// already-loaded plugin).
    ///
    /// # Errors
    ///
    /// Returns [`GenesisError::LoadRejected`] on hash mismatch, ABI
    /// mismatch, excess capabilities, a missing init export, or a dlopen
    /// failure; [`GenesisError::Io`] when the object cannot be read for
    /// hashing.
    pub fn load_plugin(
        &mut self,
        path: &Path,
        registry: &SharedRegistry,
        runner: &Runner,
        allow_override: bool,
    ) -> Result<usize, GenesisError> {
        let key = Self::canonical_key(path);
        if self.loaded.contains(&key) {
            return Ok(0);
        }
        if !path.exists() {
            return Err(GenesisError::LoadRejected {
                reason: format!("plugin not found: {}", path.display()),
            });
        }

        if let Some(expected) = self.expected_hashes.get(&key) {
            let actual = sha256_hex_file(path)?;
            if !constant_time_eq(&actual, expected) {
                return Err(GenesisError::LoadRejected {
                    reason: format!("hash mismatch for {}: expected={expected} actual={actual}", path.display()),
                });
            }
        }

        // SAFETY: the object was hash-verified above; loading foreign code
        // is inherently trusted past this point.
        let library = unsafe { Library::new(path) }.map_err(|e| GenesisError::LoadRejected {
            reason: format!("dlopen failed: {e}"),
        })?;

        // Capability mask: declared must be a subset of allowed.
        // SAFETY: symbol type matches the ABI contract.
        if let Ok(caps_fn) = unsafe { library.get::<PluginCapabilitiesFn>(abi::SYM_CAPABILITIES) } {
            let declared = unsafe { caps_fn() };
            let excess = declared & !self.allowed_caps;
            if excess != 0 {
                return Err(GenesisError::LoadRejected {
                    reason: format!(
                        "plugin capabilities exceed allowed mask: declared={declared:#010x} allowed={:#010x} excess={excess:#010x}",
                        self.allowed_caps
                    ),
                });
            }
        }

        // ABI version: equality with the host constant.
        // SAFETY: symbol type matches the ABI contract.
        match unsafe { library.get::<PluginAbiVersionFn>(abi::SYM_ABI_VERSION) } {
            Ok(version_fn) => {
                let plugin_abi = unsafe { version_fn() };
                if plugin_abi != abi::ABI_VERSION {
                    return Err(GenesisError::LoadRejected {
                        reason: format!(
                            "ABI version mismatch: host={} plugin={plugin_abi}",
                            abi::ABI_VERSION
                        ),
                    });
                }
            }
            Err(_) if self.abi_lax => {
                tracing::warn!(path = %path.display(), "plugin missing ABI version export (lax mode)");
            }
            Err(_) => {
                return Err(GenesisError::LoadRejected {
                    reason: format!(
                        "plugin missing machina_plugin_abi_version() export: {}",
                        path.display()
                    ),
                });
            }
        }

        // SAFETY: symbol type matches the ABI contract.
        let init: libloading::Symbol<'_, PluginInitFn> = unsafe {
            library.get(abi::SYM_INIT).map_err(|e| GenesisError::LoadRejected {
                reason: format!("missing symbol machina_plugin_init: {e}"),
            })?
        };
        let free_fn: Option<PluginFreeFn> =
            unsafe { library.get::<PluginFreeFn>(abi::SYM_FREE).ok().map(|s| *s) };

        let mut collector = CollectorCtx { tools: Vec::new() };
        let mut registrar = MachinaRegistrar {
            ctx: std::ptr::addr_of_mut!(collector).cast(),
            register_tool: collect_tool,
        };
        // SAFETY: the registrar outlives the init call; the callback only
        // touches the collector through the ctx pointer.
        unsafe { init(&mut registrar) };

        let mut registered = 0;
        {
            let mut reg = registry.write().expect("registry lock");
            for tool in &collector.tools {
                if let Err(err) = reg.register(tool.desc.clone(), allow_override) {
                    tracing::warn!(aid = %tool.desc.aid, error = %err, "plugin tool rejected");
                    continue;
                }
                runner.register(tool.desc.aid.clone(), wrap_entry(tool.entry, free_fn));
                registered += 1;
            }
        }

        self.libraries.push((key.clone(), library));
        self.loaded.insert(key);
        Ok(registered)
    }

    /// Loads every not-yet-loaded shared object in `dir` (sorted), best
    /// effort. Returns the number of newly loaded plugins and the first
    /// error encountered, if any.
    pub fn load_new_from_dir(
        &mut self,
        dir: &Path,
        registry: &SharedRegistry,
        runner: &Runner,
        allow_override: bool,
    ) -> (usize, Option<GenesisError>) {
        let ext = super::dynlib_ext().trim_start_matches('.');
        let Ok(entries) = std::fs::read_dir(dir) else {
            return (0, None);
        };
        let mut candidates: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == ext))
            .collect();
        candidates.sort();

        let mut loaded = 0;
        let mut first_error = None;
        for path in candidates {
            if self.is_loaded(&path) {
                continue;
            }
            match self.load_plugin(&path, registry, runner, allow_override) {
                Ok(_) => loaded += 1,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        (loaded, first_error)
    }

    /// Number of loaded plugins.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

// Wraps a raw plugin entry point into the host ToolFn shape: workspace out
// as JSON, response parsed, delta applied.
fn wrap_entry(entry: PluginToolFn, free_fn: Option<PluginFreeFn>) -> ToolFn {
    Arc::new(move |input_json: &str, ws: &mut Workspace| {
        let Ok(input_c) = CString::new(input_json) else {
            return ToolResult::error("plugin input contains NUL");
        };
        let ws_json = serde_json::to_string(ws).unwrap_or_else(|_| "{}".to_string());
        let Ok(ws_c) = CString::new(ws_json) else {
            return ToolResult::error("workspace serialization contains NUL");
        };

        // SAFETY: both pointers are live NUL-terminated strings for the
        // duration of the call; the returned buffer is owned by the plugin
        // and handed back through its free export.
        let raw = unsafe { entry(input_c.as_ptr(), ws_c.as_ptr()) };
        if raw.is_null() {
            return ToolResult::error("plugin tool returned null");
        }
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        if let Some(free) = free_fn {
            // SAFETY: raw came from this plugin's allocator.
            unsafe { free(raw) };
        }

        let Ok(resp) = serde_json::from_str::<PluginToolResponse>(&text) else {
            return ToolResult::error("plugin tool returned invalid JSON");
        };
        if let Some(state) = &resp.ds_state {
            state.apply(ws);
        }
        ToolResult {
            status: StepStatus::from_wire(&resp.status),
            output_json: if resp.output_json.is_empty() {
                "{}".to_string()
            } else {
                resp.output_json
            },
            error: resp.error,
        }
    })
}
