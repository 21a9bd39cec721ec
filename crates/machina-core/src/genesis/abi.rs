//! The plugin ABI: C symbols a loadable shared object must export.
//!
//! ```text
//! void     machina_plugin_init(MachinaRegistrar*);   // required
//! int32_t  machina_plugin_abi_version(void);         // required in prod
//! uint32_t machina_plugin_capabilities(void);        // optional
//! void     machina_plugin_free(char*);               // optional
//! ```
//!
//! `machina_plugin_init` receives a registrar handle and calls its
//! `register_tool` callback once per tool, passing the descriptor as JSON
//! and a tool entry point. Tool entry points take `(input_json,
//! workspace_json)` as NUL-terminated C strings and return a heap-allocated
//! NUL-terminated JSON response `{status, output_json, error, ds_state}`;
//! the host returns the buffer through `machina_plugin_free` when the
//! plugin exports it.
//!
//! There is no ABI stability promise across host major versions; the
//! version check is an equality check.

use std::os::raw::{c_char, c_void};

/// Host ABI version; plugins must export the same value.
pub const ABI_VERSION: i32 = 1;

/// Required init symbol name.
pub const SYM_INIT: &[u8] = b"machina_plugin_init";
/// ABI version symbol name.
pub const SYM_ABI_VERSION: &[u8] = b"machina_plugin_abi_version";
/// Optional capability symbol name.
pub const SYM_CAPABILITIES: &[u8] = b"machina_plugin_capabilities";
/// Optional free symbol name.
pub const SYM_FREE: &[u8] = b"machina_plugin_free";

/// Plugin capability flags.
pub mod caps {
    /// No capabilities.
    pub const NONE: u32 = 0;
    /// Read files under the workspace root.
    pub const FILE_READ: u32 = 1 << 0;
    /// Write files under the work dir.
    pub const FILE_WRITE: u32 = 1 << 1;
    /// Execute shell commands.
    pub const SHELL: u32 = 1 << 2;
    /// Outbound network.
    pub const NETWORK: u32 = 1 << 3;
    /// Memory stream append/query.
    pub const MEMORY: u32 = 1 << 4;
    /// Create/compile/load further plugins.
    pub const GENESIS: u32 = 1 << 5;
    /// GPU access.
    pub const GPU: u32 = 1 << 6;
    /// Everything.
    pub const ALL: u32 = u32::MAX;
}

/// A plugin tool entry point.
///
/// Returns a heap-allocated NUL-terminated JSON response; null means the
/// tool failed without a message.
pub type PluginToolFn =
    unsafe extern "C" fn(input_json: *const c_char, workspace_json: *const c_char) -> *mut c_char;

/// `machina_plugin_init`.
pub type PluginInitFn = unsafe extern "C" fn(registrar: *mut MachinaRegistrar);
/// `machina_plugin_abi_version`.
pub type PluginAbiVersionFn = unsafe extern "C" fn() -> i32;
/// `machina_plugin_capabilities`.
pub type PluginCapabilitiesFn = unsafe extern "C" fn() -> u32;
/// `machina_plugin_free`.
pub type PluginFreeFn = unsafe extern "C" fn(buf: *mut c_char);

/// The registrar handle passed into `machina_plugin_init`.
///
/// The plugin calls `register_tool(ctx, desc_json, tool)` once per tool it
/// provides. `ctx` is host-owned and opaque to the plugin.
#[repr(C)]
pub struct MachinaRegistrar {
    /// Host context pointer; opaque to the plugin.
    pub ctx: *mut c_void,
    /// Registration callback.
    pub register_tool:
        unsafe extern "C" fn(ctx: *mut c_void, desc_json: *const c_char, tool: PluginToolFn),
}

/// The parsed response a plugin tool returns.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PluginToolResponse {
    /// Wire status string.
    #[serde(default)]
    pub status: String,
    /// Tool output JSON.
    #[serde(default)]
    pub output_json: String,
    /// Error text.
    #[serde(default)]
    pub error: String,
    /// Post-call workspace state (full or delta).
    #[serde(default)]
    pub ds_state: Option<crate::workspace::WorkspaceDelta>,
}
