//! Gate conditions: boolean expression trees deciding whether a
//! downstream step runs.

use crate::context::{EventKind, RunContext};
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A boolean condition over run-context fields and named upstream outputs.
///
/// `All`/`Any` short-circuit left-to-right, so an unbound output in the
/// unevaluated remainder never raises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GateCondition {
    /// True when every child is true (short-circuits at the first false)
    All(Vec<GateCondition>),
    /// True when any child is true (short-circuits at the first true)
    Any(Vec<GateCondition>),
    /// Negation
    Not(Box<GateCondition>),
    /// The run's event kind equals the given kind
    EventIs(EventKind),
    /// The triggering ref equals the given ref exactly
    RefIs(String),
    /// The triggering ref starts with the given prefix
    /// (e.g., `refs/tags/` for tag detection)
    RefStartsWith(String),
    /// A named upstream boolean output (e.g., `on_master`). Unbound names
    /// fail with [`OrchestratorError::UnboundReference`] rather than
    /// defaulting to false.
    Output(String),
}

/// Evaluate a gate condition against a run context and bound outputs.
///
/// Pure: callers re-evaluate per downstream step; results are never cached
/// across steps with different conditions.
pub fn evaluate(
    condition: &GateCondition,
    context: &RunContext,
    outputs: &HashMap<String, bool>,
) -> Result<bool> {
    match condition {
        GateCondition::All(children) => {
            for child in children {
                if !evaluate(child, context, outputs)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        GateCondition::Any(children) => {
            for child in children {
                if evaluate(child, context, outputs)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        GateCondition::Not(child) => Ok(!evaluate(child, context, outputs)?),
        GateCondition::EventIs(kind) => Ok(context.event == *kind),
        GateCondition::RefIs(ref_name) => Ok(context.ref_name == *ref_name),
        GateCondition::RefStartsWith(prefix) => Ok(context.ref_name.starts_with(prefix)),
        GateCondition::Output(name) => outputs
            .get(name)
            .copied()
            .ok_or_else(|| OrchestratorError::UnboundReference(name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_to_master() -> RunContext {
        RunContext {
            event: EventKind::Push,
            ref_name: "refs/heads/master".to_string(),
            base_ref: None,
            sha: "abc123".to_string(),
            on_reference_branch: true,
        }
    }

    #[test]
    fn test_push_to_master_condition() {
        let condition = GateCondition::All(vec![
            GateCondition::EventIs(EventKind::Push),
            GateCondition::RefIs("refs/heads/master".to_string()),
        ]);
        assert!(evaluate(&condition, &push_to_master(), &HashMap::new()).unwrap());
    }

    #[test]
    fn test_event_mismatch() {
        let condition = GateCondition::EventIs(EventKind::PullRequest);
        assert!(!evaluate(&condition, &push_to_master(), &HashMap::new()).unwrap());
    }

    #[test]
    fn test_tag_prefix_match() {
        let mut ctx = push_to_master();
        ctx.ref_name = "refs/tags/v1.2.3".to_string();
        let condition = GateCondition::RefStartsWith("refs/tags/".to_string());
        assert!(evaluate(&condition, &ctx, &HashMap::new()).unwrap());
        assert!(!evaluate(&condition, &push_to_master(), &HashMap::new()).unwrap());
    }

    #[test]
    fn test_output_binding() {
        let condition = GateCondition::Output("on_master".to_string());
        let mut outputs = HashMap::new();
        outputs.insert("on_master".to_string(), true);
        assert!(evaluate(&condition, &push_to_master(), &outputs).unwrap());

        outputs.insert("on_master".to_string(), false);
        assert!(!evaluate(&condition, &push_to_master(), &outputs).unwrap());
    }

    #[test]
    fn test_unbound_output_fails() {
        let condition = GateCondition::Output("on_mater".to_string());
        let result = evaluate(&condition, &push_to_master(), &HashMap::new());
        assert!(matches!(
            result,
            Err(OrchestratorError::UnboundReference(name)) if name == "on_mater"
        ));
    }

    #[test]
    fn test_and_short_circuits_past_unbound() {
        // A false left side must mask an unbound right side
        let condition = GateCondition::All(vec![
            GateCondition::EventIs(EventKind::PullRequest),
            GateCondition::Output("undefined".to_string()),
        ]);
        assert!(!evaluate(&condition, &push_to_master(), &HashMap::new()).unwrap());
    }

    #[test]
    fn test_or_short_circuits_past_unbound() {
        let condition = GateCondition::Any(vec![
            GateCondition::EventIs(EventKind::Push),
            GateCondition::Output("undefined".to_string()),
        ]);
        assert!(evaluate(&condition, &push_to_master(), &HashMap::new()).unwrap());
    }

    #[test]
    fn test_not() {
        let condition =
            GateCondition::Not(Box::new(GateCondition::EventIs(EventKind::PullRequest)));
        assert!(evaluate(&condition, &push_to_master(), &HashMap::new()).unwrap());
    }

    #[test]
    fn test_empty_all_and_any() {
        let ctx = push_to_master();
        assert!(evaluate(&GateCondition::All(vec![]), &ctx, &HashMap::new()).unwrap());
        assert!(!evaluate(&GateCondition::Any(vec![]), &ctx, &HashMap::new()).unwrap());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
all:
  - event_is: push
  - ref_is: refs/heads/master
  - output: on_master
"#;
        let condition: GateCondition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            condition,
            GateCondition::All(vec![
                GateCondition::EventIs(EventKind::Push),
                GateCondition::RefIs("refs/heads/master".to_string()),
                GateCondition::Output("on_master".to_string()),
            ])
        );
    }
}
