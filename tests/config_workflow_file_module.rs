use agentflow::config::{
    load_workflows_from_dir, parse_workflow_yaml, validate_workflow, ConfigError, StepMode,
};
use agentflow::orchestration::{Invocation, UnitError, UnitInput, UnitOfWork, UnitRegistry};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

struct Named(&'static str);

#[async_trait]
impl UnitOfWork for Named {
    fn name(&self) -> &str {
        self.0
    }

    async fn execute(
        &self,
        _input: UnitInput,
        _invocation: &Invocation,
    ) -> Result<Map<String, Value>, UnitError> {
        Ok(Map::new())
    }
}

fn registry() -> UnitRegistry {
    let mut registry = UnitRegistry::new();
    for name in ["analyzer", "writer", "memory_writer"] {
        registry.register(Arc::new(Named(name))).expect("register");
    }
    registry
}

const REPLY_WORKFLOW: &str = r#"
name: reply
description: analyze then write
steps:
  - unit: analyzer
    mode: parallel
    input_mapping:
      knowledge: ctx.knowledge_text
  - unit: writer
    input_mapping:
      analysis: result.analyzer
      tone: warm
  - unit: memory_writer
    mode: Background
"#;

#[test]
fn workflow_yaml_parses_modes_and_mappings() {
    let workflow = parse_workflow_yaml(REPLY_WORKFLOW, "inline").expect("parse");

    assert_eq!(workflow.name.as_str(), "reply");
    assert_eq!(workflow.steps[0].mode, StepMode::Parallel);
    assert_eq!(workflow.steps[1].mode, StepMode::Sequential);
    assert_eq!(workflow.steps[2].mode, StepMode::Background);
    assert_eq!(workflow.steps[1].input_mapping["analysis"], "result.analyzer");
    validate_workflow(&workflow, &registry()).expect("valid");
}

#[test]
fn unknown_units_and_context_fields_are_rejected() {
    let unknown_unit = parse_workflow_yaml(
        "name: broken\nsteps:\n  - unit: translator\n",
        "inline",
    )
    .expect("parse");
    let err = validate_workflow(&unknown_unit, &registry()).expect_err("unknown unit");
    assert!(matches!(err, ConfigError::UnknownUnit { index: 0, .. }));

    let bad_field = parse_workflow_yaml(
        "name: broken\nsteps:\n  - unit: writer\n    input_mapping:\n      x: ctx.mood\n",
        "inline",
    )
    .expect("parse");
    let err = validate_workflow(&bad_field, &registry()).expect_err("unknown field");
    assert!(err.to_string().contains("unknown context field `mood`"));

    let bad_result = parse_workflow_yaml(
        "name: broken\nsteps:\n  - unit: writer\n    input_mapping:\n      x: result.analyzer\n",
        "inline",
    )
    .expect("parse");
    assert!(validate_workflow(&bad_result, &registry()).is_err());
}

#[test]
fn unrecognized_mode_is_kept_and_accepted() {
    let workflow = parse_workflow_yaml(
        "name: odd\nsteps:\n  - unit: writer\n    mode: eventually\n",
        "inline",
    )
    .expect("parse");
    assert_eq!(
        workflow.steps[0].mode,
        StepMode::Unrecognized("eventually".to_string())
    );
    validate_workflow(&workflow, &registry()).expect("accepted with warning");
}

#[test]
fn invalid_unit_names_fail_at_parse_time() {
    let err = parse_workflow_yaml("name: bad\nsteps:\n  - unit: \"has space\"\n", "bad.yaml")
        .expect_err("invalid unit name");
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn directory_load_rejects_duplicate_names() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("a.yaml"), REPLY_WORKFLOW).expect("write");
    fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

    let loaded = load_workflows_from_dir(dir.path(), &registry()).expect("load");
    assert_eq!(loaded.len(), 1);
    assert!(loaded.contains_key("reply"));

    fs::write(dir.path().join("b.yml"), REPLY_WORKFLOW).expect("write");
    let err = load_workflows_from_dir(dir.path(), &registry()).expect_err("duplicate");
    assert!(matches!(err, ConfigError::DuplicateWorkflow { .. }));
}
