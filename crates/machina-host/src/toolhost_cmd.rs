//! The toolhost child-process entry points: `serve`, `run`, and `list`.
//!
//! Each mode loads one plugin into a private registry/runner pair and then
//! speaks the protocol the executor's session pool expects. The child never
//! shares state with the host process beyond the NDJSON wire.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use machina_core::executor::{Runner, ToolFn, ToolhostServer};
use machina_core::genesis::abi::caps;
use machina_core::genesis::PluginManager;
use machina_core::registry::{shared_registry, SharedRegistry};
use machina_core::workspace::{Workspace, WorkspaceDelta};

struct LoadedPlugin {
    registry: SharedRegistry,
    runner: Arc<Runner>,
    // The manager owns the dlopen handle; tools die with it.
    _plugins: PluginManager,
}

fn load(plugin: &Path) -> Result<LoadedPlugin> {
    let registry = shared_registry();
    let runner = Arc::new(Runner::new());
    let mut plugins = PluginManager::new(caps::ALL, false);
    plugins
        .load_plugin(plugin, &registry, &runner, true)
        .with_context(|| format!("cannot load plugin {}", plugin.display()))?;
    Ok(LoadedPlugin {
        registry,
        runner,
        _plugins: plugins,
    })
}

fn build_server(loaded: &LoadedPlugin, enforce_leases: bool) -> ToolhostServer {
    let mut server = ToolhostServer::new(enforce_leases);
    let registry = loaded.registry.read().expect("registry lock");
    for desc in registry.all() {
        let runner = Arc::clone(&loaded.runner);
        let aid = desc.aid.clone();
        let forward: ToolFn = Arc::new(move |input: &str, ws: &mut Workspace| {
            runner.run(&aid, input, ws)
        });
        server.register(desc, forward);
    }
    server
}

/// `machina-host toolhost serve <plugin>`: the persistent NDJSON server.
pub fn serve(plugin: &Path, enforce_leases: bool) -> Result<()> {
    let loaded = load(plugin)?;
    let mut server = build_server(&loaded, enforce_leases);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    server
        .serve(stdin.lock(), stdout.lock())
        .context("toolhost serve loop failed")
}

/// `machina-host toolhost run <plugin> <aid>`: one request from stdin, one
/// response to stdout, exit.
pub fn run_once(plugin: &Path, aid: &str) -> Result<()> {
    let loaded = load(plugin)?;

    let mut request_text = String::new();
    std::io::stdin()
        .lock()
        .read_to_string(&mut request_text)
        .context("cannot read request from stdin")?;
    let request: serde_json::Value =
        serde_json::from_str(&request_text).context("invalid JSON request on stdin")?;

    let input_json = request["input_json"].as_str().unwrap_or("{}").to_string();
    let mut workspace = Workspace::new();
    if !request["ds_state"].is_null() {
        let state: WorkspaceDelta = serde_json::from_value(request["ds_state"].clone())
            .context("malformed ds_state")?;
        state.apply(&mut workspace);
    }

    if !loaded.runner.has(aid) {
        bail!("tool not found in plugin: {aid}");
    }
    let result = loaded.runner.run(aid, &input_json, &mut workspace);

    let response = serde_json::json!({
        "ok": true,
        "status": result.status.as_str(),
        "output_json": result.output_json,
        "error": result.error,
        "ds_state": WorkspaceDelta::full(&workspace),
    });
    let mut out = std::io::stdout().lock();
    out.write_all(response.to_string().as_bytes())?;
    out.flush()?;
    Ok(())
}

/// `machina-host toolhost list <plugin>`: emit the plugin's descriptors.
pub fn list(plugin: &Path) -> Result<()> {
    let loaded = load(plugin)?;
    let registry = loaded.registry.read().expect("registry lock");
    let response = serde_json::json!({
        "ok": true,
        "tools": registry.all(),
    });
    let mut out = std::io::stdout().lock();
    out.write_all(response.to_string().as_bytes())?;
    out.flush()?;
    Ok(())
}
