//! Interactive menu mode.
//!
//! A select menu over the catalog plus a free-form entry. Chosen templates
//! prompt for their declared variables one at a time. Esc backs out to the
//! menu; Ctrl-C leaves interactive mode with the usual interrupt handling.

use std::collections::HashMap;

use inquire::{InquireError, Select, Text};

use crate::core::error::{Error, Result};
use crate::core::prompt::{self, catalog::PromptCatalog};
use crate::core::runner::Runner;
use crate::core::terminal;

const ASK_OPTION: &str = "Ask a question";
const QUIT_OPTION: &str = "Quit";

pub async fn run(catalog: &PromptCatalog, runner: &Runner) -> Result<()> {
    terminal::print_banner();

    loop {
        let mut prompts = catalog.list_builtin().await?;
        prompts.extend(catalog.list_custom().await?);

        let mut options: Vec<String> = Vec::with_capacity(prompts.len() + 2);
        options.push(ASK_OPTION.to_string());
        for summary in &prompts {
            let marker = if summary.custom { " (custom)" } else { "" };
            options.push(format!("{}{}: {}", summary.name, marker, summary.description));
        }
        options.push(QUIT_OPTION.to_string());

        let choice = match Select::new("What would you like to run?", options.clone()).prompt() {
            Ok(choice) => choice,
            Err(InquireError::OperationCanceled)
            | Err(InquireError::OperationInterrupted) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if choice == QUIT_OPTION {
            return Ok(());
        }
        let Some(index) = options.iter().position(|o| *o == choice) else {
            continue;
        };

        let outcome = if choice == ASK_OPTION {
            ask_flow(runner).await
        } else {
            template_flow(catalog, runner, &prompts[index - 1].id).await
        };

        match outcome {
            Ok(()) => {}
            // Ctrl-C mid-run: settle the exit code through main.
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            // Anything else keeps the menu alive.
            Err(e) => terminal::print_error(&format!("{e}")),
        }
    }
}

async fn ask_flow(runner: &Runner) -> Result<()> {
    let question = match Text::new("Your question:").prompt() {
        Ok(question) => question,
        Err(InquireError::OperationCanceled) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if question.trim().is_empty() {
        terminal::print_warn("Nothing to ask.");
        return Ok(());
    }
    runner.run_freeform_query(question.trim()).await.map(|_| ())
}

async fn template_flow(catalog: &PromptCatalog, runner: &Runner, id: &str) -> Result<()> {
    let Some(template) = catalog.load(id).await? else {
        terminal::print_warn(&format!("Prompt '{id}' disappeared; refreshing the menu."));
        return Ok(());
    };

    let mut variables = HashMap::new();
    for spec in prompt::extract_variables(&template.body) {
        let value = match Text::new(&format!("{}:", spec.description)).prompt() {
            Ok(value) => value,
            Err(InquireError::OperationCanceled) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            terminal::print_warn(&format!("'{}' is required; backing out.", spec.name));
            return Ok(());
        }
        variables.insert(spec.name, value);
    }

    runner.run_prompt_analysis(id, variables).await.map(|_| ())
}
