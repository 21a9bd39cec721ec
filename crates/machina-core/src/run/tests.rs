use std::sync::Arc;

use super::*;
use crate::executor::Runner;
use crate::selector::Selection;
use crate::genesis::GenesisConfig;
use crate::journal::{verify_chain, Journal};
use crate::registry::shared_registry;
use crate::selector::HeuristicSelector;
use crate::types::RunHeader;

struct Harness {
    loop_: StepLoop,
    host: Arc<HostServices>,
    dir: tempfile::TempDir,
}

fn harness(config: RunConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(HostServices::new(
        shared_registry(),
        Arc::new(Runner::new()),
        dir.path(),
        GenesisConfig::default(),
    ));
    register_meta_tools(&host);

    let mut goals = GoalRegistry::new();
    goals
        .register(
            GoalDesc {
                goal_id: "goal.ERROR_SCAN.v1".to_string(),
                candidate_tags: vec!["tag.error".to_string()],
                required_slots: vec![0],
                any_slot_sufficient: false,
            },
            false,
        )
        .unwrap();

    let loop_ = StepLoop::new(Arc::clone(&host), goals, config);
    Harness { loop_, host, dir }
}

fn register_scan_tool(host: &HostServices) {
    let mut registry = host.registry.write().unwrap();
    registry
        .register(
            ToolDesc {
                aid: "AID.ERROR_SCAN.v1".to_string(),
                name: "error scan".to_string(),
                deterministic: true,
                tags: vec!["tag.error".to_string()],
                side_effects: vec!["none".to_string()],
                replay_inputs: vec![],
            },
            false,
        )
        .unwrap();
    drop(registry);
    host.runner.register(
        "AID.ERROR_SCAN.v1",
        Arc::new(|input: &str, ws: &mut Workspace| {
            let _ = ws.put(
                0,
                Artifact::new("summary", "error_scan", format!(r#"{{"scanned":true,"inputs":{input}}}"#)),
            );
            ToolResult::ok(r#"{"rows":3}"#)
        }) as ToolFn,
    );
}

fn scan_request() -> RunRequest {
    RunRequest {
        goal_id: "goal.ERROR_SCAN.v1".to_string(),
        candidate_tags: vec!["tag.error".to_string(), "tag.meta".to_string()],
        inputs_json: r#"{"input_path":"samples/log.csv","pattern":"ERROR","max_rows":100}"#
            .to_string(),
        control_mode: ControlMode::FallbackOnly,
        ..RunRequest::default()
    }
}

fn journal_events(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| {
            serde_json::from_str::<serde_json::Value>(l).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect()
}

#[test]
fn happy_run_journals_the_expected_sequence() {
    let h = harness(RunConfig::default());
    register_scan_tool(&h.host);

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_happy.jsonl")).unwrap();
    let mut selector = HeuristicSelector::new();

    let report = h
        .loop_
        .execute(&scan_request(), &mut selector, &mut journal)
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::GoalDone);
    assert_eq!(report.outcome.exit_code(), 0);
    assert!(report.state.has(0));
    assert_eq!(report.invocations.len(), 1);
    assert!(report.invocations[0].ok);

    drop(journal);
    let events = journal_events(&report.journal_path);
    assert_eq!(
        events,
        vec![
            "menu_built",
            "selector_fallback_raw",
            "selector_policy_raw",
            "selector_chosen",
            "tool_ok",
            "goal_done",
        ]
    );
    assert!(verify_chain(&report.journal_path).unwrap().is_intact());
}

#[test]
fn invalid_picks_trip_the_breaker() {
    struct Garbage;
    impl Selector for Garbage {
        fn select(
            &mut self,
            _menu: &crate::menu::Menu,
            _ctx: &str,
            _digest: &str,
            _mode: ControlMode,
            _inputs: &str,
        ) -> Selection {
            crate::selector::parse_selector_output("<GARBAGE>")
        }
    }

    let config = RunConfig {
        budget: Budget {
            max_steps: 64,
            max_invalid_picks: 3,
        },
        ..RunConfig::default()
    };
    let h = harness(config);
    register_scan_tool(&h.host);

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_breaker.jsonl")).unwrap();
    let report = h
        .loop_
        .execute(&scan_request(), &mut Garbage, &mut journal)
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Breaker("max_invalid_picks".to_string()));
    assert_eq!(report.outcome.exit_code(), 1);

    drop(journal);
    let events = journal_events(&report.journal_path);
    let invalid_count = events.iter().filter(|e| *e == "invalid_pick").count();
    assert_eq!(invalid_count, 4, "budget 3 allows three, the fourth trips");
    assert_eq!(events.last().unwrap(), "breaker");

    let text = std::fs::read_to_string(&report.journal_path).unwrap();
    assert!(text.contains(r#""reason":"max_invalid_picks""#));
}

#[test]
fn ask_sup_stores_the_question_and_exits_clean() {
    struct AskingSelector;
    impl Selector for AskingSelector {
        fn select(
            &mut self,
            _menu: &crate::menu::Menu,
            _ctx: &str,
            _digest: &str,
            _mode: ControlMode,
            _inputs: &str,
        ) -> Selection {
            crate::selector::parse_selector_output("<ASK_SUP><END>")
        }
    }

    let h = harness(RunConfig::default());
    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_ask.jsonl")).unwrap();
    let request = RunRequest {
        goal_id: "goal.UNKNOWN.v1".to_string(),
        candidate_tags: vec!["tag.meta".to_string()],
        ..RunRequest::default()
    };
    let report = h.loop_.execute(&request, &mut AskingSelector, &mut journal).unwrap();

    assert_eq!(report.outcome, RunOutcome::AskSup);
    assert_eq!(report.outcome.exit_code(), 0);
    assert!(report.state.has(5), "the help request is stored");
    drop(journal);
    let events = journal_events(&report.journal_path);
    assert_eq!(events.last().unwrap(), "ask_sup");
}

#[test]
fn loop_guard_trips_on_repeating_state() {
    struct AlwaysPickNoop;
    impl Selector for AlwaysPickNoop {
        fn select(
            &mut self,
            menu: &crate::menu::Menu,
            _ctx: &str,
            _digest: &str,
            _mode: ControlMode,
            _inputs: &str,
        ) -> Selection {
            // Pick a registered tool that never changes the workspace, so
            // (menu, state) repeats forever.
            let sid = menu.first_with_aid("AID.IDLE.v1").unwrap().sid;
            crate::selector::parse_selector_output(&format!("<PICK><{}><END>", sid.to_wire()))
        }
    }

    let h = harness(RunConfig::default());
    {
        let mut registry = h.host.registry.write().unwrap();
        registry
            .register(
                ToolDesc {
                    aid: "AID.IDLE.v1".to_string(),
                    name: "idle".to_string(),
                    deterministic: true,
                    tags: vec!["tag.meta".to_string()],
                    side_effects: vec!["none".to_string()],
                    replay_inputs: vec![],
                },
                false,
            )
            .unwrap();
        drop(registry);
        h.host.runner.register(
            "AID.IDLE.v1",
            Arc::new(|_: &str, _: &mut Workspace| ToolResult::ok("{}")) as ToolFn,
        );
    }

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_guard.jsonl")).unwrap();
    let request = RunRequest {
        goal_id: "goal.NEVER.v1".to_string(),
        candidate_tags: vec!["tag.meta".to_string()],
        ..RunRequest::default()
    };
    let report = h
        .loop_
        .execute(&request, &mut AlwaysPickNoop, &mut journal)
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::LoopGuard);
    drop(journal);
    let events = journal_events(&report.journal_path);
    assert_eq!(events.last().unwrap(), "loop_guard_triggered");
    // Three identical (menu, state) rounds ran before the fourth tripped.
    assert_eq!(events.iter().filter(|e| *e == "tool_ok").count(), 3);
}

#[test]
fn tool_error_rolls_back_and_terminates() {
    let h = harness(RunConfig::default());
    {
        let mut registry = h.host.registry.write().unwrap();
        registry
            .register(
                ToolDesc {
                    aid: "AID.ERROR_SCAN.v1".to_string(),
                    name: "failing scan".to_string(),
                    deterministic: true,
                    tags: vec!["tag.error".to_string()],
                    side_effects: vec!["none".to_string()],
                    replay_inputs: vec![],
                },
                false,
            )
            .unwrap();
        drop(registry);
        h.host.runner.register(
            "AID.ERROR_SCAN.v1",
            Arc::new(|_: &str, ws: &mut Workspace| {
                // Mutate, then fail: the mutation must not survive.
                let _ = ws.put(0, Artifact::new("junk", "fail", "{}"));
                ToolResult::error("scan exploded")
            }) as ToolFn,
        );
    }

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_err.jsonl")).unwrap();
    let mut selector = HeuristicSelector::new();
    let report = h
        .loop_
        .execute(&scan_request(), &mut selector, &mut journal)
        .unwrap();

    match &report.outcome {
        RunOutcome::ToolError { aid, error } => {
            assert_eq!(aid, "AID.ERROR_SCAN.v1");
            assert_eq!(error, "scan exploded");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(
        report.state.slots.is_empty(),
        "rollback must leave the workspace unchanged"
    );
    assert_eq!(report.outcome.exit_code(), 1);
}

#[test]
fn missing_tool_without_auto_genesis_fails() {
    struct PickMissing;
    impl Selector for PickMissing {
        fn select(
            &mut self,
            menu: &crate::menu::Menu,
            _ctx: &str,
            _digest: &str,
            _mode: ControlMode,
            _inputs: &str,
        ) -> Selection {
            let sid = menu.first_with_aid("AID.GHOST.v1").unwrap().sid;
            crate::selector::parse_selector_output(&format!("<PICK><{}><END>", sid.to_wire()))
        }
    }

    let h = harness(RunConfig::default());
    // Registered in the registry (so it appears in the menu) but never in
    // the runner.
    h.host
        .registry
        .write()
        .unwrap()
        .register(
            ToolDesc {
                aid: "AID.GHOST.v1".to_string(),
                name: "ghost".to_string(),
                deterministic: true,
                tags: vec!["tag.meta".to_string()],
                side_effects: vec!["none".to_string()],
                replay_inputs: vec![],
            },
            false,
        )
        .unwrap();

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_ghost.jsonl")).unwrap();
    let request = RunRequest {
        goal_id: "goal.X.v1".to_string(),
        candidate_tags: vec!["tag.meta".to_string()],
        ..RunRequest::default()
    };
    let report = h.loop_.execute(&request, &mut PickMissing, &mut journal).unwrap();
    match report.outcome {
        RunOutcome::ToolError { error, .. } => {
            assert_eq!(error, "MISSING_TOOL: AID.GHOST.v1");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn capability_block_removes_tool_from_menu() {
    let h = harness(RunConfig::default());
    register_scan_tool(&h.host);

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_cap.jsonl")).unwrap();
    let mut selector = HeuristicSelector::new();
    let request = RunRequest {
        blocked_tools: vec!["AID.ERROR_SCAN.v1".to_string()],
        ..scan_request()
    };
    let report = h.loop_.execute(&request, &mut selector, &mut journal).unwrap();
    // With the scan tool filtered out the goal can never complete; the run
    // ends on a clean selector outcome instead of ever invoking the tool.
    assert!(!report.state.has(0));
    assert!(report.invocations.iter().all(|i| i.aid != "AID.ERROR_SCAN.v1"));
}

#[test]
fn selector_input_patch_is_filtered_and_applied() {
    struct PatchingSelector;
    impl Selector for PatchingSelector {
        fn select(
            &mut self,
            menu: &crate::menu::Menu,
            _ctx: &str,
            _digest: &str,
            _mode: ControlMode,
            _inputs: &str,
        ) -> Selection {
            let sid = menu.first_with_aid("AID.ERROR_SCAN.v1").unwrap().sid;
            crate::selector::parse_selector_output(&format!(
                r#"<PICK><{}><INP>{{"max_rows":5,"_system_x":"forged"}}</INP><END>"#,
                sid.to_wire()
            ))
        }
    }

    let h = harness(RunConfig::default());
    register_scan_tool(&h.host);

    let header = RunHeader::new();
    let mut journal = Journal::create(&header, h.dir.path().join("logs/run_patch.jsonl")).unwrap();
    let report = h
        .loop_
        .execute(&scan_request(), &mut PatchingSelector, &mut journal)
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::GoalDone);
    let ds0: serde_json::Value =
        serde_json::from_str(&report.state.get(0).unwrap().content_json).unwrap();
    assert_eq!(ds0["inputs"]["max_rows"], 5, "patched key reached the tool");
    assert!(
        ds0["inputs"]["_system_x"].is_null(),
        "reserved-prefix key must be dropped"
    );
    drop(journal);
    let events = journal_events(&report.journal_path);
    assert!(events.contains(&"inputs_patched".to_string()));
}

#[test]
fn run_request_parsing() {
    let doc = r#"{
        "goal_id": "goal.ERROR_SCAN.v1",
        "candidate_tags": ["tag.error"],
        "inputs": {"input_path": "x.csv"},
        "control_mode": "BLENDED",
        "request_id": "rq-9",
        "_capabilities": {"allowed_tools": ["AID.ERROR_SCAN.*"], "blocked_tools": []}
    }"#;
    let request = RunRequest::from_json(doc).unwrap();
    assert_eq!(request.goal_id, "goal.ERROR_SCAN.v1");
    assert!(request.candidate_tags.contains(&"tag.meta".to_string()));
    assert_eq!(request.control_mode, ControlMode::Blended);
    assert_eq!(request.request_id, "rq-9");
    assert_eq!(request.allowed_tools, vec!["AID.ERROR_SCAN.*"]);
    assert!(request.inputs_json.contains("x.csv"));

    assert!(RunRequest::from_json("{}").is_err());
    assert!(RunRequest::from_json("not json").is_err());
}

#[test]
fn autostub_source_passes_the_guard() {
    let source = super::autostub_source("AID.CUSTOM.MISSING.v1", "autostub_0011223344556677");
    crate::genesis::guard::scan_source(&source).unwrap();
    assert!(source.contains("machina_plugin_init"));
    assert!(source.contains("machina_plugin_abi_version"));
    assert!(source.contains("AID.CUSTOM.MISSING.v1"));
}
