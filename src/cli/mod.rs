//! Command dispatch.
//!
//! Hand-rolled over `std::env::args`; the surface is small enough that a
//! parser dependency would cost more than this match. Every command settles
//! to `Ok` after printing its own message except the ones whose failure
//! should set the exit code, which propagate.

mod interactive;

use std::collections::HashMap;
use std::sync::Arc;

use console::style;
use tokio_util::sync::CancellationToken;

use crate::core::config::{self, Config};
use crate::core::error::{Error, Result};
use crate::core::history::{RunStatus, RunStore};
use crate::core::mcp::McpSession;
use crate::core::present::PresenterRegistry;
use crate::core::prompt::{self, catalog::PromptCatalog, catalog::PromptSummary};
use crate::core::runner::Runner;
use crate::core::status::StatusSink;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Running")
        .command("run <prompt-id>", "Run a stored prompt (--var name=value fills variables)")
        .command("ask <question>", "Ask a free-form question through the tool server")
        .command("interactive", "Menu-driven mode (alias: -i)")
        .print();

    GuideSection::new("Prompts")
        .command("prompts list", "List built-in and custom prompts")
        .command("prompts show <id>", "Print a prompt body, optionally with --var filled in")
        .command("prompts save <name>", "Store a custom prompt from --file <path>")
        .command("prompts delete <id>", "Remove a custom prompt")
        .print();

    GuideSection::new("History")
        .command("history list", "List recorded runs, newest first")
        .command("history show <run-id>", "Print one run record with its log")
        .command("history clear", "Delete all run records")
        .print();

    GuideSection::new("Diagnostics")
        .command("tools", "Connect to the tool server and list its tools")
        .print();

    println!(
        " {} {} <command> [arguments]\n",
        style("Usage:").bold(),
        style("runebook").green()
    );
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let config = Config::from_env();
    let context_dir = config::context_dir();
    let presenters = Arc::new(PresenterRegistry::with_builtins());
    let catalog = PromptCatalog::new(context_dir.clone(), presenters);
    catalog.init().await?;

    let cancel = CancellationToken::new();
    {
        // First Ctrl-C cancels the active run; a second one kills the process.
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match args[1].as_str() {
        "run" => {
            let Some(prompt_id) = args.get(2).filter(|a| !a.starts_with('-')) else {
                print_error("Expected a prompt id. Usage: runebook run <prompt-id> [--var name=value ...]");
                return Ok(());
            };
            let variables = parse_var_flags(&args, 3)?;
            let runner = Runner::new(config, context_dir, StatusSink::stdout(), cancel);
            runner.run_prompt_analysis(prompt_id, variables).await?;
            Ok(())
        }
        "ask" => {
            let question = args[2..].join(" ");
            if question.trim().is_empty() {
                print_error("Expected a question. Usage: runebook ask <question>");
                return Ok(());
            }
            let runner = Runner::new(config, context_dir, StatusSink::stdout(), cancel);
            runner.run_freeform_query(question.trim()).await?;
            Ok(())
        }
        "prompts" => prompts_command(&catalog, &args).await,
        "history" => history_command(RunStore::new(context_dir.join("history")), &args).await,
        "tools" => {
            let (url, api_key) = config.require_mcp()?;
            McpSession::connect(url, api_key, StatusSink::stdout()).await?;
            Ok(())
        }
        "interactive" | "-i" => {
            let runner = Runner::new(config, context_dir, StatusSink::stdout(), cancel);
            interactive::run(&catalog, &runner).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {other}"));
            print_help();
            Ok(())
        }
    }
}

async fn prompts_command(catalog: &PromptCatalog, args: &[String]) -> Result<()> {
    match args.get(2).map(String::as_str) {
        None | Some("list") => {
            let builtin = catalog.list_builtin().await?;
            let custom = catalog.list_custom().await?;

            println!("\n {}", style("Built-in prompts").bold().underlined());
            for summary in &builtin {
                print_summary(summary);
            }
            println!("\n {}", style("Custom prompts").bold().underlined());
            if custom.is_empty() {
                println!("   {}", style("(none saved yet)").dim());
            }
            for summary in &custom {
                print_summary(summary);
            }
            println!();
            Ok(())
        }
        Some("show") => {
            let Some(id) = args.get(3) else {
                print_error("Usage: runebook prompts show <id> [--var name=value ...]");
                return Ok(());
            };
            let Some(template) = catalog.load(id).await? else {
                return Err(Error::not_found(id));
            };
            let variables = parse_var_flags(args, 4)?;
            let preview = prompt::substitute(&template.body, &variables);

            println!(
                "\n{} {}",
                style(&template.name).bold(),
                style(format!("({})", template.id)).dim()
            );
            if !template.description.is_empty() {
                println!("{}", style(&template.description).dim());
            }
            terminal::print_rule('-');
            println!("{}", preview.trim_end());
            terminal::print_rule('-');
            for name in prompt::unresolved_placeholders(&preview) {
                if prompt::DATA_PLACEHOLDERS.contains(&name.as_str()) {
                    continue;
                }
                terminal::print_warn(&format!("Placeholder '{{{{{name}}}}}' has no value"));
            }
            Ok(())
        }
        Some("save") => {
            let Some(name) = args.get(3).filter(|a| !a.starts_with("--")) else {
                print_error(
                    "Usage: runebook prompts save <name> --file <path> [--id <id>] [--description <text>]",
                );
                return Ok(());
            };
            let flags = parse_save_flags(args, 4);
            let Some(file) = flags.file else {
                print_error("--file <path> is required; it supplies the prompt body.");
                return Ok(());
            };
            let body = tokio::fs::read_to_string(&file).await?;
            let target = flags
                .id
                .clone()
                .unwrap_or_else(|| prompt::catalog::derive_id(name));
            if catalog.exists(&target) {
                terminal::print_warn(&format!("A prompt with id '{target}' already exists."));
            }
            let id = catalog
                .save(name, &body, flags.id.as_deref(), flags.description.as_deref())
                .await?;
            terminal::print_success(&format!("Saved custom prompt '{id}'"));
            Ok(())
        }
        Some("delete") => {
            let Some(id) = args.get(3) else {
                print_error("Usage: runebook prompts delete <id>");
                return Ok(());
            };
            if catalog.delete(id).await? {
                terminal::print_success(&format!("Deleted custom prompt '{id}'"));
            } else {
                terminal::print_warn(&format!("No custom prompt named '{id}'"));
            }
            Ok(())
        }
        Some(other) => {
            print_error(&format!("Unknown prompts command: {other}"));
            print_help();
            Ok(())
        }
    }
}

fn print_summary(summary: &PromptSummary) {
    let marker = if summary.has_presenter { " *" } else { "" };
    println!(
        "   {} {}{}",
        style(format!("{:<24}", summary.id)).green(),
        summary.description,
        style(marker).dim()
    );
}

async fn history_command(store: RunStore, args: &[String]) -> Result<()> {
    match args.get(2).map(String::as_str) {
        None | Some("list") => {
            let records = store.list().await?;
            if records.is_empty() {
                terminal::print_info("No runs recorded yet.");
                return Ok(());
            }
            println!();
            for record in &records {
                println!(
                    "   {}  {}  {}",
                    style(format!("{:<24}", record.id)).green(),
                    style_status(record.status),
                    record.label
                );
            }
            println!();
            Ok(())
        }
        Some("show") => {
            let Some(run_id) = args.get(3) else {
                print_error("Usage: runebook history show <run-id>");
                return Ok(());
            };
            let Some(record) = store.get(run_id).await? else {
                terminal::print_warn(&format!("No run record named '{run_id}'"));
                return Ok(());
            };

            println!(
                "\n{} {}",
                style(&record.label).bold(),
                style(format!("({})", record.id)).dim()
            );
            println!("   status:      {}", style_status(record.status));
            if let Some(prompt_id) = &record.prompt_id {
                println!("   prompt:      {prompt_id}");
            }
            println!("   started at:  {}", record.started_at);
            if let Some(finished_at) = &record.finished_at {
                println!("   finished at: {finished_at}");
            }
            if !record.log.is_empty() {
                terminal::print_rule('-');
                for line in &record.log {
                    println!("{line}");
                }
            }
            if let Some(result) = &record.result {
                terminal::print_rule('=');
                println!("{result}");
                terminal::print_rule('=');
            }
            Ok(())
        }
        Some("clear") => {
            let removed = store.clear().await?;
            terminal::print_success(&format!("Removed {removed} run record(s)"));
            Ok(())
        }
        Some(other) => {
            print_error(&format!("Unknown history command: {other}"));
            print_help();
            Ok(())
        }
    }
}

fn style_status(status: RunStatus) -> console::StyledObject<String> {
    let text = format!("{:<9}", status);
    match status {
        RunStatus::Complete => style(text).green(),
        RunStatus::Failed => style(text).red(),
        RunStatus::Running => style(text).yellow(),
        RunStatus::Cancelled => style(text).yellow().dim(),
    }
}

/// Collect repeated `--var name=value` pairs. Unknown flags are skipped so
/// commands can grow new ones without breaking old invocations.
pub(crate) fn parse_var_flags(args: &[String], start: usize) -> Result<HashMap<String, String>> {
    let mut variables = HashMap::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--var" | "-v" => {
                let Some(pair) = args.get(i + 1) else {
                    return Err(Error::validation("--var expects name=value"));
                };
                let Some((name, value)) = pair.split_once('=') else {
                    return Err(Error::validation(format!(
                        "invalid --var '{pair}': expected name=value"
                    )));
                };
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::validation(format!(
                        "invalid --var '{pair}': empty name"
                    )));
                }
                variables.insert(name.to_string(), value.to_string());
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(variables)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SaveFlags {
    pub file: Option<String>,
    pub id: Option<String>,
    pub description: Option<String>,
}

pub(crate) fn parse_save_flags(args: &[String], start: usize) -> SaveFlags {
    let mut flags = SaveFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    flags.file = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--id" => {
                if i + 1 < args.len() {
                    flags.id = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--description" | "-d" => {
                if i + 1 < args.len() {
                    flags.description = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::{parse_save_flags, parse_var_flags};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_var_flags_reads_repeated_pairs() {
        let args = argv(&[
            "runebook",
            "run",
            "triage",
            "--var",
            "scope=printers",
            "--var",
            "days=7",
        ]);
        let vars = parse_var_flags(&args, 3).unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.get("scope").map(String::as_str), Some("printers"));
        assert_eq!(vars.get("days").map(String::as_str), Some("7"));
    }

    #[test]
    fn parse_var_flags_keeps_equals_signs_in_values() {
        let args = argv(&["runebook", "run", "x", "--var", "filter=os=macOS"]);
        let vars = parse_var_flags(&args, 3).unwrap();
        assert_eq!(vars.get("filter").map(String::as_str), Some("os=macOS"));
    }

    #[test]
    fn parse_var_flags_rejects_malformed_pairs() {
        let args = argv(&["runebook", "run", "x", "--var", "noequals"]);
        assert!(parse_var_flags(&args, 3).is_err());

        let args = argv(&["runebook", "run", "x", "--var"]);
        assert!(parse_var_flags(&args, 3).is_err());
    }

    #[test]
    fn parse_var_flags_skips_unknown_flags() {
        let args = argv(&["runebook", "run", "x", "--verbose", "--var", "a=b"]);
        let vars = parse_var_flags(&args, 3).unwrap();
        assert_eq!(vars.len(), 1);
    }

    #[test]
    fn parse_save_flags_reads_all_three() {
        let args = argv(&[
            "runebook",
            "prompts",
            "save",
            "Port Digest",
            "--file",
            "digest.md",
            "--id",
            "port-digest",
            "--description",
            "Summarize open ports",
        ]);
        let flags = parse_save_flags(&args, 4);
        assert_eq!(flags.file.as_deref(), Some("digest.md"));
        assert_eq!(flags.id.as_deref(), Some("port-digest"));
        assert_eq!(flags.description.as_deref(), Some("Summarize open ports"));
    }

    #[test]
    fn parse_save_flags_tolerates_trailing_flag() {
        let args = argv(&["runebook", "prompts", "save", "X", "--file"]);
        let flags = parse_save_flags(&args, 4);
        assert!(flags.file.is_none());
    }
}
