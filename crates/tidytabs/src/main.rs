//! TidyTabs CLI
//!
//! Reconciles a saved browser session file: deduplicates, cleans up, groups,
//! and repositions its tabs, then writes the session back.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tidytabs_core::controller::{Controller, RunOutcome, RunReport};
use tidytabs_core::executor::filter_by_skip_rule;
use tidytabs_core::host::{MemoryIndicator, TabHost};
use tidytabs_core::logging::{LogConfig, LogError, LogFormat, init_logging};
use tidytabs_core::planner::{count_duplicates, partition_by_group_key};
use tidytabs_core::rules::RuleSet;
use tidytabs_core::session::{SessionHost, SessionState};
use tidytabs_core::settings::{MemorySettingsStore, SettingsState};

/// Settings file looked up in the working directory when `--settings` is
/// not given.
const DEFAULT_SETTINGS_FILE: &str = "tidytabs.toml";

/// TidyTabs - browser tab reconciliation
#[derive(Parser)]
#[command(name = "tidytabs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass over a session file
    Run {
        /// Session file (JSON) to reconcile
        #[arg(short = 'f', long)]
        session: PathBuf,

        /// Group per window instead of merging into the focused window
        #[arg(long)]
        by_window: bool,

        /// Report what would change without writing the session back
        #[arg(long)]
        dry_run: bool,

        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect a session file without changing it
    Status {
        /// Session file (JSON) to inspect
        #[arg(short = 'f', long)]
        session: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the configured per-domain rules
    Rules {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_logging(&cli)?;

    let settings = load_settings(cli.settings.as_deref())?;

    match cli.command {
        Commands::Run {
            session,
            by_window,
            dry_run,
            json,
        } => cmd_run(&session, settings, by_window, dry_run, json).await,
        Commands::Status { session, json } => cmd_status(&session, &settings, json).await,
        Commands::Rules { json } => cmd_rules(&settings, json),
    }
}

fn init_cli_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_config = LogConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
        file: cli.log_file.clone(),
    };
    match init_logging(&log_config) {
        Ok(()) | Err(LogError::AlreadyInitialized) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Load settings from the given path, or from `tidytabs.toml` in the
/// working directory, falling back to defaults when neither exists.
///
/// An explicitly passed path that cannot be read is an error; the implicit
/// default path is allowed to be absent.
fn load_settings(path: Option<&Path>) -> anyhow::Result<SettingsState> {
    match path {
        Some(path) => SettingsState::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => SettingsState::load_or_default(Path::new(DEFAULT_SETTINGS_FILE))
            .context("loading default settings"),
    }
}

async fn cmd_run(
    session_path: &Path,
    mut settings: SettingsState,
    by_window: bool,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    if by_window {
        settings.grouping.by_window = true;
    }

    let document = SessionState::load(session_path)
        .with_context(|| format!("loading session from {}", session_path.display()))?;
    let tabs_before = document.tab_count();

    let host = Arc::new(SessionHost::new(document));
    let indicator = Arc::new(MemoryIndicator::new());
    let controller = Controller::new(
        Arc::clone(&host) as Arc<dyn TabHost>,
        Arc::new(MemorySettingsStore::new(settings)),
        indicator,
    );

    let report = match controller.execute().await? {
        RunOutcome::Completed(report) => report,
        RunOutcome::AlreadyRunning => anyhow::bail!("another run is already in flight"),
    };

    let after = host.state_snapshot();
    if dry_run {
        tracing::info!(path = %session_path.display(), "dry run, session not written");
    } else {
        after
            .save(session_path)
            .with_context(|| format!("writing session to {}", session_path.display()))?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, tabs_before, after.tab_count(), dry_run);
    }
    Ok(())
}

fn print_report(report: &RunReport, tabs_before: usize, tabs_after: usize, dry_run: bool) {
    let started = chrono::DateTime::from_timestamp_millis(report.started_at_ms as i64)
        .map(|ts| {
            ts.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string());
    let duration_ms = report.finished_at_ms.saturating_sub(report.started_at_ms);

    println!("Run #{} at {started} ({duration_ms} ms)", report.run_id);
    println!("  tabs:          {tabs_before} -> {tabs_after}");
    println!("  merged:        {}", report.merged_tabs);
    println!("  duplicates:    {} closed", report.duplicates_closed);
    println!("  auto-deleted:  {}", report.auto_deleted);
    println!(
        "  groups:        {} applied, {} failed",
        report.states_applied, report.state_failures
    );
    println!("  singles freed: {}", report.singles_ungrouped);
    println!("  layout plans:  {}", report.plans_executed);
    if dry_run {
        println!("  (dry run: session file unchanged)");
    }
}

async fn cmd_status(
    session_path: &Path,
    settings: &SettingsState,
    json: bool,
) -> anyhow::Result<()> {
    let document = SessionState::load(session_path)
        .with_context(|| format!("loading session from {}", session_path.display()))?;
    let rules = RuleSet::compile(&settings.rules);

    let host = SessionHost::new(document.clone());
    let tabs = host.list_all_tabs().await?;
    let processable = filter_by_skip_rule(
        tabs.into_iter().filter(|tab| !tab.is_internal()).collect(),
        &rules,
    );
    let duplicates = count_duplicates(&processable);

    // Partitions of at least two tabs are what a run would group.
    let qualifying: Vec<(String, usize)> = partition_by_group_key(&processable, &rules)
        .into_iter()
        .filter(|partition| partition.len() >= 2)
        .map(|partition| (partition.key.clone(), partition.len()))
        .collect();

    let groups: Vec<(String, usize)> = document
        .groups
        .iter()
        .map(|group| {
            let members = document
                .windows
                .iter()
                .flat_map(|window| window.tabs.iter())
                .filter(|tab| tab.group == Some(group.id))
                .count();
            let title = group.title.clone().unwrap_or_else(|| "untitled".to_string());
            (title, members)
        })
        .collect();

    if json {
        let value = serde_json::json!({
            "path": session_path.display().to_string(),
            "windows": document.windows.len(),
            "tabs": document.tab_count(),
            "processable": processable.len(),
            "duplicates": duplicates,
            "groups": groups
                .iter()
                .map(|(title, members)| serde_json::json!({ "title": title, "tabs": members }))
                .collect::<Vec<_>>(),
            "qualifying": qualifying
                .iter()
                .map(|(key, tabs)| serde_json::json!({ "key": key, "tabs": tabs }))
                .collect::<Vec<_>>(),
            "rules": settings.rules.len(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "Session: {} ({} windows, {} tabs)",
        session_path.display(),
        document.windows.len(),
        document.tab_count()
    );
    println!("Processable: {} tabs", processable.len());
    println!("Duplicates: {duplicates} surplus");
    if groups.is_empty() {
        println!("Groups: none");
    } else {
        println!("Groups:");
        for (title, members) in &groups {
            println!("  {title:?} - {members} tabs");
        }
    }
    if qualifying.is_empty() {
        println!("Would group: nothing");
    } else {
        println!("Would group:");
        for (key, tabs) in &qualifying {
            println!("  {key:?} - {tabs} tabs");
        }
    }
    println!("Rules: {}", settings.rules.len());
    Ok(())
}

fn cmd_rules(settings: &SettingsState, json: bool) -> anyhow::Result<()> {
    if settings.rules.is_empty() {
        if json {
            println!("[]");
        } else {
            println!("No rules configured.");
        }
        return Ok(());
    }

    if json {
        let entries: Vec<serde_json::Value> = settings
            .rules
            .iter()
            .map(|rule| match rule.normalized() {
                Ok(rule) => {
                    let mut value = serde_json::to_value(&rule).unwrap_or_default();
                    if let Some(object) = value.as_object_mut() {
                        object.insert("kept".to_string(), serde_json::Value::Bool(true));
                    }
                    value
                }
                Err(err) => serde_json::json!({
                    "domain": rule.domain,
                    "kept": false,
                    "reason": err.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for rule in &settings.rules {
        match rule.normalized() {
            Ok(rule) => {
                let mut notes = Vec::new();
                if rule.skip_process {
                    notes.push("skip".to_string());
                }
                if rule.auto_delete {
                    notes.push("auto-delete".to_string());
                }
                if let Some(name) = &rule.group_name {
                    notes.push(format!("group \"{name}\""));
                }
                let notes = if notes.is_empty() {
                    "-".to_string()
                } else {
                    notes.join(", ")
                };
                println!("  {:<28} {notes}", rule.domain);
            }
            Err(err) => {
                println!("  {:<28} dropped: {err}", rule.domain);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidytabs_core::session::{SessionTab, SessionWindow};
    use tidytabs_core::tabs::{TabId, WindowId};

    #[test]
    fn missing_default_settings_fall_back() {
        assert!(load_settings(None).is_ok());
    }

    #[test]
    fn explicit_missing_settings_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nope.toml");
        assert!(load_settings(Some(&path)).is_err());
    }

    #[tokio::test]
    async fn run_command_rewrites_the_session_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");

        let session = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(SessionTab::new(TabId(1)).with_url("https://example.com/a"))
                .with_tab(SessionTab::new(TabId(2)).with_url("https://example.com/a"))
                .with_tab(SessionTab::new(TabId(3)).with_url("https://example.com/b")),
        );
        session.save(&path).expect("seed session");

        cmd_run(&path, SettingsState::default(), false, false, false)
            .await
            .expect("run");

        let after = SessionState::load(&path).expect("reload");
        assert_eq!(after.tab_count(), 2, "duplicate closed and written back");
        assert_eq!(after.group_titles(), vec!["example.com"]);
    }

    #[tokio::test]
    async fn dry_run_leaves_the_file_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");

        let session = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(SessionTab::new(TabId(1)).with_url("https://example.com/a"))
                .with_tab(SessionTab::new(TabId(2)).with_url("https://example.com/a")),
        );
        session.save(&path).expect("seed session");

        cmd_run(&path, SettingsState::default(), false, true, false)
            .await
            .expect("dry run");

        let after = SessionState::load(&path).expect("reload");
        assert_eq!(after, session, "dry run must not rewrite the file");
    }
}
