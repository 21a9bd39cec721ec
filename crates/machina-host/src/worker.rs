//! Run execution wiring: host services, goal registration, and the
//! per-job handler the queue runtime invokes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use machina_core::executor::Runner;
use machina_core::genesis::{GenesisConfig, HostServices};
use machina_core::journal::Journal;
use machina_core::queue::{JobMetric, JobReport};
use machina_core::registry::shared_registry;
use machina_core::run::{
    register_genesis_tools, register_meta_tools, GoalDesc, GoalRegistry, RunConfig, RunRequest,
    StepLoop,
};
use machina_core::selector::{HeuristicSelector, PolicyConfig, PolicySelector, Selector};
use machina_core::types::RunHeader;

/// Everything a worker needs to execute runs.
pub struct RunContext {
    step_loop: StepLoop,
    root: PathBuf,
    policy: PolicyConfig,
}

impl RunContext {
    /// Builds host services rooted at `root`: meta tools, Genesis tools,
    /// and the programmatic goal set.
    pub fn new(root: impl Into<PathBuf>, genesis: GenesisConfig, policy: PolicyConfig) -> Self {
        let root = root.into();
        let host = Arc::new(HostServices::new(
            shared_registry(),
            Arc::new(Runner::new()),
            &root,
            genesis,
        ));
        register_meta_tools(&host);
        register_genesis_tools(&host);

        let mut goals = GoalRegistry::new();
        // Goalpack file loading stays outside the core; the Genesis and
        // demo goals are registered programmatically.
        let _ = goals.register(
            GoalDesc {
                goal_id: "goal.GENESIS".to_string(),
                candidate_tags: vec!["tag.genesis".to_string()],
                required_slots: vec![0, 7],
                any_slot_sufficient: false,
            },
            true,
        );
        let _ = goals.register(
            GoalDesc {
                goal_id: "goal.DEMO.MISSING_TOOL.v1".to_string(),
                candidate_tags: vec!["tag.meta".to_string()],
                required_slots: vec![0],
                any_slot_sufficient: false,
            },
            true,
        );

        let step_loop = StepLoop::new(host, goals, RunConfig::default());
        Self {
            step_loop,
            root,
            policy,
        }
    }

    /// Access to the goal registry for additional registrations.
    pub fn goals_mut(&mut self) -> &mut GoalRegistry {
        self.step_loop.goals_mut()
    }

    fn make_selector(&self) -> Box<dyn Selector> {
        if self.policy.command.is_empty() {
            Box::new(HeuristicSelector::new())
        } else {
            Box::new(PolicySelector::new(
                Box::new(HeuristicSelector::new()),
                self.policy.clone(),
            ))
        }
    }

    /// Executes the request document at `path` and returns the queue-facing
    /// report.
    pub fn run_job(&self, path: &Path) -> JobReport {
        match self.run_job_inner(path) {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "job execution failed");
                JobReport {
                    exit_code: 2,
                    log_path: String::new(),
                    metrics: Vec::new(),
                }
            }
        }
    }

    fn run_job_inner(&self, path: &Path) -> Result<JobReport> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read request {}", path.display()))?;
        let request = RunRequest::from_json(&text).context("request document rejected")?;

        let mut header = RunHeader::new();
        header.request_id = request.request_id.clone();

        let log_path = self
            .root
            .join("logs")
            .join(format!("run_{}.jsonl", header.run_id));
        let mut journal = Journal::create(&header, &log_path).context("cannot open journal")?;
        let mut selector = self.make_selector();

        let report = self
            .step_loop
            .execute(&request, selector.as_mut(), &mut journal)
            .context("step loop failed")?;

        tracing::info!(
            outcome = ?report.outcome,
            steps = report.steps,
            log = %log_path.display(),
            "run finished"
        );

        let log_rel = log_path
            .strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| log_path.display().to_string());

        Ok(JobReport {
            exit_code: report.outcome.exit_code(),
            log_path: log_rel,
            metrics: report
                .invocations
                .iter()
                .map(|i| JobMetric {
                    aid: i.aid.clone(),
                    ok: i.ok,
                    duration_ms: i.duration_ms,
                })
                .collect(),
        })
    }
}
