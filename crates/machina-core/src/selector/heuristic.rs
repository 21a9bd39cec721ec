//! Deterministic tier-0 selector.
//!
//! State flags ride inside the goal context string the step loop assembles:
//!
//! ```text
//! <goal_id>|FLAGS:DS0=1;DS2=0;DS6=1;DS7=0;DS6_STAGE=WROTE;|tag.error|tag.meta
//! ```
//!
//! Precedence, first match wins:
//!
//! 1. Genesis stage ladder when the goal id names a `goal.GENESIS*` goal
//!    (no stage → write, `WROTE` → compile, `COMPILED` → load, `LOADED` →
//!    run the freshly registered `tag.runtime` tool once, then NOOP)
//! 2. DS0 present and DS2 absent → first `tag.report` tool
//! 3. Tag ladder: `tag.error`, `tag.gpu`, `tag.fs`, `tag.shell`, `tag.net`,
//!    `tag.meta`
//! 4. NOOP
//!
//! Within a tag the lowest SID wins, skipping the NOOP entry.

use super::{parse_selector_output, pick_wire, ControlMode, Selection, Selector};
use crate::genesis::{AID_COMPILE_SHARED, AID_LOAD_PLUGIN, AID_WRITE_FILE, STAGE_COMPILED, STAGE_LOADED, STAGE_WROTE};
use crate::menu::Menu;

const TAG_LADDER: &[&str] = &[
    "tag.error",
    "tag.gpu",
    "tag.fs",
    "tag.shell",
    "tag.net",
    "tag.meta",
];

/// The deterministic fallback selector.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicSelector;

impl HeuristicSelector {
    /// Creates the selector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Extracts a `KEY=VALUE;` flag from a goal context string.
#[must_use]
pub(crate) fn extract_flag(goal_context: &str, key: &str) -> String {
    let needle = format!("{key}=");
    let Some(pos) = goal_context.find(&needle) else {
        return String::new();
    };
    let rest = &goal_context[pos + needle.len()..];
    let end = rest.find(';').unwrap_or(rest.len());
    rest[..end].to_string()
}

fn flag_set(goal_context: &str, key: &str) -> bool {
    extract_flag(goal_context, key) == "1"
}

fn pick(menu: &Menu, aid: &str) -> Option<Selection> {
    menu.first_with_aid(aid)
        .map(|item| parse_selector_output(&pick_wire(item.sid)))
}

fn pick_tag(menu: &Menu, tag: &str) -> Option<Selection> {
    menu.first_with_tag(tag)
        .map(|item| parse_selector_output(&pick_wire(item.sid)))
}

impl Selector for HeuristicSelector {
    fn select(
        &mut self,
        menu: &Menu,
        goal_context: &str,
        _state_digest: &str,
        _mode: ControlMode,
        _inputs_json: &str,
    ) -> Selection {
        // Genesis bootstrap ladder.
        if goal_context.contains("goal.GENESIS") {
            let ds0 = flag_set(goal_context, "DS0");
            let stage = extract_flag(goal_context, "DS6_STAGE");

            let staged = match stage.as_str() {
                "" => pick(menu, AID_WRITE_FILE),
                STAGE_WROTE => pick(menu, AID_COMPILE_SHARED),
                STAGE_COMPILED => pick(menu, AID_LOAD_PLUGIN),
                STAGE_LOADED => {
                    if !ds0 && menu.has_tag("tag.runtime") {
                        pick_tag(menu, "tag.runtime")
                    } else {
                        Some(parse_selector_output("<NOOP><END>"))
                    }
                }
                _ => None,
            };
            if let Some(sel) = staged {
                return sel;
            }
            // Stage tool missing from the menu: fall through to the general
            // rules.
        }

        if flag_set(goal_context, "DS0") && !flag_set(goal_context, "DS2") {
            if let Some(sel) = pick_tag(menu, "tag.report") {
                return sel;
            }
        }

        for tag in TAG_LADDER {
            if let Some(sel) = pick_tag(menu, tag) {
                return sel;
            }
        }

        parse_selector_output("<NOOP><END>")
    }
}
