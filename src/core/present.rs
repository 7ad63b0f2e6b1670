//! Post-run presentation handlers.
//!
//! Some templates want extra output after the model answers (a summary line,
//! save instructions for generated content). Handlers are registered
//! statically at startup, keyed by template id; there is no dynamic code
//! loading. A handler only prints: the core never consumes anything from it.

use std::collections::HashMap;

use console::style;
use regex::Regex;

use crate::core::prompt;

pub trait Presenter: Send + Sync {
    /// Called with the final result text after a run completes.
    fn present(&self, result: &str);
}

pub struct PresenterRegistry {
    handlers: HashMap<String, Box<dyn Presenter>>,
}

impl PresenterRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The registry the CLI runs with: every built-in handler registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("_example", Box::new(WordCount));
        registry.register("prompt-builder", Box::new(TemplateExtract));
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, handler: Box<dyn Presenter>) {
        self.handlers.insert(id.into(), handler);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Run the handler for `id`, if one is registered. Returns whether one
    /// ran.
    pub fn present(&self, id: &str, result: &str) -> bool {
        match self.handlers.get(id) {
            Some(handler) => {
                handler.present(result);
                true
            }
            None => false,
        }
    }
}

/// `_example` handler: a one-line length summary.
struct WordCount;

impl Presenter for WordCount {
    fn present(&self, result: &str) {
        let words = result.split_whitespace().count();
        println!("{}", style(format!("Response length: {} words", words)).dim());
    }
}

/// `prompt-builder` handler: pull the generated template out of the reply
/// and show how to keep it.
struct TemplateExtract;

impl Presenter for TemplateExtract {
    fn present(&self, result: &str) {
        let Some(template) = extract_template(result) else {
            return;
        };

        let (meta, _) = prompt::parse_frontmatter(&template);
        let name = meta.get("name").cloned().unwrap_or_default();

        println!();
        println!("{}", style("Generated template:").bold());
        println!("{}", style(&template).dim());
        println!();
        let suggested = if name.is_empty() {
            "<name>".to_string()
        } else {
            format!("\"{}\"", name)
        };
        println!(
            "Save it with: runebook prompts save {} --file <path-to-saved-template.md>",
            suggested
        );
    }
}

/// The template inside an LLM reply: a fenced ```markdown block, or failing
/// that everything from the first frontmatter delimiter on.
fn extract_template(result: &str) -> Option<String> {
    let fenced = Regex::new(r"(?s)```markdown\s*\n(.*?)```").unwrap();
    if let Some(caps) = fenced.captures(result) {
        return Some(caps[1].trim().to_string());
    }
    result
        .find("---\n")
        .map(|idx| result[idx..].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_its_handlers() {
        let registry = PresenterRegistry::with_builtins();
        assert!(registry.contains("_example"));
        assert!(registry.contains("prompt-builder"));
        assert!(!registry.contains("quick-summary"));
    }

    #[test]
    fn present_reports_whether_a_handler_ran() {
        let registry = PresenterRegistry::with_builtins();
        assert!(registry.present("_example", "three short words"));
        assert!(!registry.present("unknown-id", "ignored"));
    }

    #[test]
    fn template_extraction_prefers_fenced_block() {
        let reply = "Here you go:\n```markdown\n---\nname: X\n---\nbody\n```\nEnjoy.";
        assert_eq!(
            extract_template(reply).as_deref(),
            Some("---\nname: X\n---\nbody")
        );
    }

    #[test]
    fn template_extraction_falls_back_to_frontmatter_start() {
        let reply = "Sure!\n---\nname: Y\n---\n## Analysis Prompt\ngo\n";
        let extracted = extract_template(reply).unwrap();
        assert!(extracted.starts_with("---\nname: Y"));
        assert!(extracted.ends_with("go"));
    }

    #[test]
    fn template_extraction_gives_up_quietly() {
        assert_eq!(extract_template("no template here"), None);
    }
}
