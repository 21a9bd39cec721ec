//! End-to-end Genesis round-trip: write → compile → load → run the freshly
//! registered tool, driven by the heuristic selector through the real step
//! loop. Requires a C++ compiler; tests skip themselves when none is
//! installed.

use std::sync::Arc;

use machina_core::executor::Runner;
use machina_core::genesis::{self, GenesisConfig, HostServices};
use machina_core::journal::{verify_chain, Journal};
use machina_core::registry::shared_registry;
use machina_core::run::{
    register_genesis_tools, register_meta_tools, GoalDesc, GoalRegistry, RunConfig, RunOutcome,
    RunRequest, StepLoop,
};
use machina_core::selector::{ControlMode, HeuristicSelector};
use machina_core::types::{RunHeader, StepStatus};
use machina_core::workspace::Workspace;

// A self-contained plugin that registers one "hello" runtime tool whose
// response adds a DS0 artifact. No includes: the Genesis guard would reject
// most headers anyway.
const HELLO_PLUGIN_SOURCE: &str = r##"
typedef char* (*machina_tool_fn)(const char*, const char*);

struct MachinaRegistrar {
    void* ctx;
    void (*register_tool)(void* ctx, const char* desc_json, machina_tool_fn tool);
};

namespace {
char g_response[] = R"resp({"status":"OK","output_json":"{\"hello\":true}","error":"","ds_state":{"delta":true,"slots":{"0":{"type":"text","provenance":"hello_tool","content_json":"{\"msg\":\"hello\"}","size_bytes":16}},"removed_slots":[]}})resp";

char* hello_tool(const char*, const char*) {
    return g_response;
}
} // namespace

extern "C" int machina_plugin_abi_version() { return 1; }

extern "C" unsigned int machina_plugin_capabilities() { return 0u; }

extern "C" void machina_plugin_init(MachinaRegistrar* host) {
    host->register_tool(
        host->ctx,
        R"desc({"aid":"AID.HELLO.v1","name":"hello","deterministic":true,"tags":["tag.runtime","tag.meta"],"side_effects":["none"],"replay_inputs":[]})desc",
        &hello_tool);
}
"##;

fn compiler_present() -> bool {
    std::process::Command::new("g++")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn genesis_host(root: &std::path::Path) -> Arc<HostServices> {
    let config = GenesisConfig {
        enabled: true,
        ..GenesisConfig::default()
    };
    let host = Arc::new(HostServices::new(
        shared_registry(),
        Arc::new(Runner::new()),
        root,
        config,
    ));
    register_meta_tools(&host);
    register_genesis_tools(&host);
    host
}

fn genesis_inputs() -> String {
    serde_json::json!({
        "relative_path": "hello_tool.cpp",
        "content": HELLO_PLUGIN_SOURCE,
        "overwrite": true,
        "src_relative_path": "hello_tool.cpp",
        "out_name": "hello_tool",
    })
    .to_string()
}

#[test]
fn genesis_round_trip_reaches_goal_done() {
    if !compiler_present() {
        eprintln!("skipping: no g++ available");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let host = genesis_host(dir.path());

    let mut goals = GoalRegistry::new();
    goals
        .register(
            GoalDesc {
                goal_id: "goal.GENESIS".to_string(),
                candidate_tags: vec!["tag.genesis".to_string()],
                required_slots: vec![0, 7],
                any_slot_sufficient: false,
            },
            false,
        )
        .unwrap();

    let step_loop = StepLoop::new(Arc::clone(&host), goals, RunConfig::default());
    let request = RunRequest {
        goal_id: "goal.GENESIS_DEMO_HELLO.v1".to_string(),
        candidate_tags: vec!["tag.genesis".to_string(), "tag.meta".to_string()],
        inputs_json: genesis_inputs(),
        control_mode: ControlMode::FallbackOnly,
        ..RunRequest::default()
    };

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, dir.path().join("logs/genesis.jsonl")).unwrap();
    let mut selector = HeuristicSelector::new();

    let report = step_loop.execute(&request, &mut selector, &mut journal).unwrap();
    drop(journal);

    assert_eq!(report.outcome, RunOutcome::GoalDone, "journal: {:?}", report.journal_path);

    // DS0 came from the hot-loaded tool; DS6 walked WROTE → COMPILED →
    // LOADED and ended on LOADED with the verified hash.
    let ds0: serde_json::Value =
        serde_json::from_str(&report.state.get(0).unwrap().content_json).unwrap();
    assert_eq!(ds0["msg"], "hello");

    let ds6: serde_json::Value =
        serde_json::from_str(&report.state.get(6).unwrap().content_json).unwrap();
    assert_eq!(ds6["stage"], "LOADED");
    let loaded_sha = ds6["sha256"].as_str().unwrap();
    assert_eq!(loaded_sha.len(), 64);

    // The hash the load stage verified equals the compile stage's output.
    let text = std::fs::read_to_string(&report.journal_path).unwrap();
    let compiled_sha = text
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter(|v| v["event"] == "tool_ok")
        .filter_map(|v| {
            v["payload"]["tx_patch"]
                .as_array()
                .and_then(|ops| {
                    ops.iter().find_map(|op| {
                        let content = op["value"]["content_json"].as_str()?;
                        let stage: serde_json::Value = serde_json::from_str(content).ok()?;
                        (stage["stage"] == "COMPILED")
                            .then(|| stage["sha256"].as_str().map(ToString::to_string))
                            .flatten()
                    })
                })
        })
        .next()
        .expect("a COMPILED stage marker in the journal");
    assert_eq!(compiled_sha, loaded_sha);

    // The ladder journaled in order and the chain is intact.
    let events: Vec<String> = text
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"]
            .as_str()
            .unwrap()
            .to_string())
        .collect();
    let tool_oks = events.iter().filter(|e| *e == "tool_ok").count();
    assert_eq!(tool_oks, 4, "write, compile, load, hello: {events:?}");
    assert_eq!(events.last().unwrap(), "goal_done");
    assert!(verify_chain(&report.journal_path).unwrap().is_intact());
}

#[test]
fn mutated_plugin_fails_the_load_hash_check() {
    if !compiler_present() {
        eprintln!("skipping: no g++ available");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let host = genesis_host(dir.path());
    let inputs = genesis_inputs();
    let mut state = Workspace::new();

    let write = host.runner.run(genesis::AID_WRITE_FILE, &inputs, &mut state);
    assert_eq!(write.status, StepStatus::Ok, "{}", write.error);
    let compile = host.runner.run(genesis::AID_COMPILE_SHARED, &inputs, &mut state);
    assert_eq!(compile.status, StepStatus::Ok, "{}", compile.error);

    // Mutate the shared object between compile and load.
    let so_path = host
        .plugin_root()
        .join(format!("hello_tool{}", genesis::dynlib_ext()));
    let mut bytes = std::fs::read(&so_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&so_path, &bytes).unwrap();

    let load = host.runner.run(genesis::AID_LOAD_PLUGIN, &inputs, &mut state);
    assert_eq!(load.status, StepStatus::ToolError);
    assert!(load.error.contains("hash mismatch"), "{}", load.error);

    // The stage marker still says COMPILED; nothing was registered.
    let ds6: serde_json::Value =
        serde_json::from_str(&state.get(6).unwrap().content_json).unwrap();
    assert_eq!(ds6["stage"], "COMPILED");
    assert!(!host.runner.has("AID.HELLO.v1"));
}

#[test]
fn untampered_manual_ladder_loads_and_runs() {
    if !compiler_present() {
        eprintln!("skipping: no g++ available");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let host = genesis_host(dir.path());
    let inputs = genesis_inputs();
    let mut state = Workspace::new();

    for aid in [genesis::AID_WRITE_FILE, genesis::AID_COMPILE_SHARED, genesis::AID_LOAD_PLUGIN] {
        let result = host.runner.run(aid, &inputs, &mut state);
        assert_eq!(result.status, StepStatus::Ok, "{aid}: {}", result.error);
    }
    assert!(host.runner.has("AID.HELLO.v1"));

    let hello = host.runner.run("AID.HELLO.v1", "{}", &mut state);
    assert_eq!(hello.status, StepStatus::Ok, "{}", hello.error);
    assert!(state.has(0));
}
