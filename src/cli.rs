use crate::config::{
    default_settings_path, load_settings, load_workflow_from_path, LogFormat, Settings,
};
use crate::orchestration::{plan_step_groups, StepGroup};
use crate::reminders::parse_step_due_date;
use crate::runtime::stale_cutoff;
use crate::shared::time::{now_utc, parse_db_timestamp, to_db_timestamp};
use crate::storage::{QueueTable, RequestStatus, SqliteStore};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

const USAGE: &str = "usage: agentflow <command> [--config <path>]\n\
commands:\n  \
init-db                       create the database schema\n  \
status                        request counts per table and status\n  \
recover-stale                 reset abandoned processing requests\n  \
show-workflow <file>          print a workflow's execution groups\n  \
due-date <timing> [--base <rfc3339>] [--index <n>]  compute a reminder due date";

const QUEUE_TABLES: [QueueTable; 2] = [QueueTable::DraftRequests, QueueTable::PlanRequests];

#[derive(Debug, Default)]
struct Flags {
    config: Option<PathBuf>,
    base: Option<String>,
    index: Option<usize>,
    positional: Vec<String>,
}

fn parse_flags(args: &[String]) -> Result<Flags, String> {
    let mut flags = Flags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("`{name}` requires a value"))
        };
        match arg.as_str() {
            "--config" => flags.config = Some(PathBuf::from(value("--config")?)),
            "--base" => flags.base = Some(value("--base")?),
            "--index" => {
                let raw = value("--index")?;
                flags.index = Some(
                    raw.parse()
                        .map_err(|_| format!("`--index` expects a number, got `{raw}`"))?,
                );
            }
            other if other.starts_with("--") => return Err(format!("unknown flag `{other}`")),
            other => flags.positional.push(other.to_string()),
        }
    }
    Ok(flags)
}

fn settings(flags: &Flags) -> Result<Settings, String> {
    let path = flags.config.clone().unwrap_or_else(default_settings_path);
    load_settings(&path).map_err(|e| e.to_string())
}

fn open_store(settings: &Settings) -> Result<SqliteStore, String> {
    let store = SqliteStore::open(&settings.database_path).map_err(|e| e.to_string())?;
    store.ensure_schema().map_err(|e| e.to_string())?;
    Ok(store)
}

/// Log level and format from the settings file the command will read.
///
/// A missing or unreadable file falls back to warnings only; the command
/// itself reports the problem.
pub fn log_preferences(args: &[String]) -> (String, LogFormat) {
    let path = args
        .windows(2)
        .find(|pair| pair[0] == "--config")
        .map(|pair| PathBuf::from(&pair[1]))
        .unwrap_or_else(default_settings_path);
    match Settings::from_path(&path) {
        Ok(settings) => (settings.log_level, settings.log_format),
        Err(_) => ("warn".to_string(), LogFormat::Compact),
    }
}

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let Some((command, rest)) = args.split_first() else {
        return Err(USAGE.to_string());
    };
    let flags = parse_flags(rest)?;
    match command.as_str() {
        "init-db" => cmd_init_db(&flags),
        "status" => cmd_status(&flags),
        "recover-stale" => cmd_recover_stale(&flags),
        "show-workflow" => cmd_show_workflow(&flags),
        "due-date" => cmd_due_date(&flags),
        "help" | "--help" | "-h" => Ok(USAGE.to_string()),
        other => Err(format!("unknown command `{other}`\n{USAGE}")),
    }
}

fn cmd_init_db(flags: &Flags) -> Result<String, String> {
    let settings = settings(flags)?;
    let store = open_store(&settings)?;
    let tables = store.table_names().map_err(|e| e.to_string())?;
    Ok(format!(
        "database ready at {}\ntables: {}",
        store.path().display(),
        tables.join(", ")
    ))
}

fn cmd_status(flags: &Flags) -> Result<String, String> {
    let settings = settings(flags)?;
    let store = open_store(&settings)?;
    let mut lines = Vec::new();
    for table in QUEUE_TABLES {
        let mut counts = Vec::new();
        for status in [
            RequestStatus::Pending,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
        ] {
            let count = store
                .count_requests(table, status)
                .map_err(|e| e.to_string())?;
            counts.push(format!("{}={count}", status.as_str()));
        }
        lines.push(format!("{table}: {}", counts.join(" ")));
    }
    Ok(lines.join("\n"))
}

fn cmd_recover_stale(flags: &Flags) -> Result<String, String> {
    let settings = settings(flags)?;
    let store = open_store(&settings)?;
    let cutoff = stale_cutoff(
        now_utc(),
        Duration::from_secs(settings.pollers.stale_after_secs),
    );
    let mut lines = Vec::new();
    for table in QUEUE_TABLES {
        let recovered = store
            .reset_stale_requests(table, cutoff)
            .map_err(|e| e.to_string())?;
        lines.push(format!("{table}: recovered={recovered}"));
    }
    Ok(lines.join("\n"))
}

fn cmd_show_workflow(flags: &Flags) -> Result<String, String> {
    let path = flags
        .positional
        .first()
        .ok_or_else(|| "show-workflow requires a workflow file".to_string())?;
    let workflow = load_workflow_from_path(Path::new(path)).map_err(|e| e.to_string())?;

    let mut lines = vec![format!("workflow {}", workflow.name)];
    for (index, group) in plan_step_groups(&workflow.steps).into_iter().enumerate() {
        let line = match group {
            StepGroup::Sequential(step) => format!("{}. sequential {}", index + 1, step.unit),
            StepGroup::Parallel(batch) => {
                let units: Vec<&str> = batch.iter().map(|step| step.unit.as_str()).collect();
                format!("{}. parallel {}", index + 1, units.join(" + "))
            }
            StepGroup::Background(step) => format!("{}. background {}", index + 1, step.unit),
        };
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

fn cmd_due_date(flags: &Flags) -> Result<String, String> {
    let timing = flags
        .positional
        .first()
        .ok_or_else(|| "due-date requires a timing expression".to_string())?;
    let base = match &flags.base {
        Some(raw) => parse_db_timestamp(raw)?,
        None => now_utc(),
    };
    let spacing = flags
        .config
        .as_ref()
        .map(|_| settings(flags).map(|s| s.reminders.default_spacing_days))
        .transpose()?
        .unwrap_or(3);

    let mut step = Map::new();
    step.insert("timing".to_string(), Value::String(timing.clone()));
    let due = parse_step_due_date(&step, base, flags.index.unwrap_or(0), spacing);
    Ok(to_db_timestamp(due))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn due_date_command_applies_timing_rules() {
        let output = run_cli(args(&[
            "due-date",
            "2 weeks",
            "--base",
            "2026-03-01T09:00:00Z",
        ]))
        .expect("due date");
        assert_eq!(output, "2026-03-15T09:00:00.000000Z");
    }

    #[test]
    fn init_db_and_status_use_configured_database() {
        let dir = tempdir().expect("tempdir");
        let config = dir.path().join("agentflow.yaml");
        fs::write(
            &config,
            format!("database_path: {}\n", dir.path().join("data/agentflow.db").display()),
        )
        .expect("write config");
        let config = config.display().to_string();

        let output = run_cli(args(&["init-db", "--config", &config])).expect("init-db");
        assert!(output.contains("draft_requests"));
        assert!(output.contains("scheduled_reminders"));

        let status = run_cli(args(&["status", "--config", &config])).expect("status");
        assert!(status.contains("draft_requests: pending=0 processing=0"));
    }

    #[test]
    fn log_preferences_follow_the_selected_config() {
        let dir = tempdir().expect("tempdir");
        let config = dir.path().join("agentflow.yaml");
        fs::write(
            &config,
            "database_path: /tmp/agentflow.db\nlog_level: debug\nlog_format: json\n",
        )
        .expect("write config");
        let config = config.display().to_string();

        assert_eq!(
            log_preferences(&args(&["status", "--config", &config])),
            ("debug".to_string(), LogFormat::Json)
        );
        let missing = dir.path().join("missing.yaml").display().to_string();
        assert_eq!(
            log_preferences(&args(&["status", "--config", &missing])),
            ("warn".to_string(), LogFormat::Compact)
        );
    }

    #[test]
    fn unknown_command_reports_usage() {
        let err = run_cli(args(&["launch"])).expect_err("unknown command");
        assert!(err.contains("unknown command `launch`"));
        assert!(err.contains("usage: agentflow"));
    }
}
