//! Markdown prompt templates.
//!
//! A template is a markdown document with optional `---` frontmatter
//! (`key: value` lines) and optional `## Variables`, `## Tools`,
//! `## MCP Query` and `## Analysis Prompt` sections, in any order:
//!
//! ```text
//! ---
//! name: MAC Risk Summarizer
//! description: Risk posture for a device by MAC address
//! ---
//! ## Variables
//! - `mac_address`: Device MAC address
//!
//! ## MCP Query
//! Find the device with MAC {{mac_address}} and list its alerts.
//!
//! ## Analysis Prompt
//! Summarize the risk posture of this device:
//!
//! {{result}}
//! ```
//!
//! `{{name}}` placeholders are replaced literally (non-recursive) across the
//! whole body before any section is extracted, so substitutions work inside
//! every section including the MCP query. Unknown placeholders stay verbatim.
//! Parsing is total: malformed markdown degrades, it never fails.

pub mod catalog;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;

/// A stored template: identity plus the body below the frontmatter.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub body: String,
}

/// One template after variable substitution, split into the pieces the
/// analysis flows consume. Lives for a single invocation.
#[derive(Debug, Clone)]
pub struct ParsedPrompt {
    /// Tool names the template declares it needs; empty means "no tool
    /// required"
    pub declared_tools: Vec<String>,
    /// Text of the `## MCP Query` section; `None` marks an LLM-only template
    pub deterministic_query: Option<String>,
    /// Text handed to the chat model; falls back to the whole substituted
    /// body when there is no `## Analysis Prompt` header
    pub analysis_text: String,
    /// The full substituted body, kept for fallbacks and previews
    pub raw_full_text: String,
}

/// A declared input, used only to drive input collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub name: String,
    pub description: String,
}

/// Legacy data tokens older templates used interchangeably for "the fetched
/// tool output". All four are replaced during the deterministic flow.
pub const DATA_PLACEHOLDERS: [&str; 4] = ["device_data", "data", "mcp_data", "result"];

/// Split a leading `---` frontmatter block into `key: value` metadata and
/// the remaining body. Keys are lowercased. No block (or an unterminated
/// one) yields empty metadata and the whole text as body.
pub fn parse_frontmatter(text: &str) -> (HashMap<String, String>, &str) {
    let mut meta = HashMap::new();

    let mut lines = text.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return (meta, text);
    };
    if first.trim_end() != "---" {
        return (meta, text);
    }

    let mut consumed = first.len();
    let mut closed = false;
    for line in lines {
        consumed += line.len();
        if line.trim_end() == "---" {
            closed = true;
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase();
            if !key.is_empty() {
                meta.insert(key, value.trim().to_string());
            }
        }
    }

    if !closed {
        return (HashMap::new(), text);
    }
    (meta, &text[consumed..])
}

/// Replace every `{{name}}` occurrence with the supplied value. Literal and
/// non-recursive; placeholders without a supplied value stay verbatim.
pub fn substitute(text: &str, variables: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

/// Content of the `## <name>` section: every line after the header up to the
/// next `## ` header, trimmed. `None` when the header is absent; a header
/// with no body yields `Some("")`.
pub fn extract_section(text: &str, name: &str) -> Option<String> {
    let header = format!("## {}", name);
    let mut collecting = false;
    let mut content: Vec<&str> = Vec::new();
    for line in text.lines() {
        if collecting {
            if line.starts_with("## ") {
                break;
            }
            content.push(line);
        } else if line.trim_end() == header {
            collecting = true;
        }
    }
    collecting.then(|| content.join("\n").trim().to_string())
}

/// Like [`extract_section`] but runs to end of text instead of stopping at
/// the next header. The analysis prompt owns everything below its header.
fn extract_tail_section(text: &str, name: &str) -> Option<String> {
    let header = format!("## {}", name);
    let mut collecting = false;
    let mut content: Vec<&str> = Vec::new();
    for line in text.lines() {
        if collecting {
            content.push(line);
        } else if line.trim_end() == header {
            collecting = true;
        }
    }
    collecting.then(|| content.join("\n").trim().to_string())
}

/// Parse a template body (frontmatter already removed) with the supplied
/// variables. Total: any text yields a usable [`ParsedPrompt`].
pub fn parse_content(body: &str, variables: &HashMap<String, String>) -> ParsedPrompt {
    let substituted = substitute(body, variables);

    let deterministic_query = extract_section(&substituted, "MCP Query");
    let analysis_text = extract_tail_section(&substituted, "Analysis Prompt")
        .unwrap_or_else(|| substituted.clone());
    let declared_tools = parse_tools(extract_section(&substituted, "Tools").as_deref());

    ParsedPrompt {
        declared_tools,
        deterministic_query,
        analysis_text,
        raw_full_text: substituted,
    }
}

/// Tool identifiers from a `## Tools` section, one `- name` per line
/// (backticks optional). The tokens `none` / `n/a` / `-`, or any line
/// mentioning "no tools" or "llm-only", empty the whole list: the override
/// short-circuits, it does not accumulate.
fn parse_tools(section: Option<&str>) -> Vec<String> {
    let Some(section) = section else {
        return Vec::new();
    };

    let mut tools = Vec::new();
    for line in section.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_lowercase();
        if lowered.contains("no tools") || lowered.contains("llm-only") {
            return Vec::new();
        }
        let item = line
            .strip_prefix("- ")
            .unwrap_or(line)
            .trim()
            .trim_matches('`')
            .trim();
        match item.to_lowercase().as_str() {
            "none" | "n/a" | "-" => return Vec::new(),
            _ => {}
        }
        if !item.is_empty() {
            tools.push(item.to_string());
        }
    }
    tools
}

/// Declared variables from the `## Variables` section. Lines must look like
/// ``- `name`: description``; anything else is ignored.
pub fn extract_variables(body: &str) -> Vec<VariableSpec> {
    let Some(section) = extract_section(body, "Variables") else {
        return Vec::new();
    };
    let re = Regex::new(r"^-\s*`(\w+)`\s*:\s*(.+)$").unwrap();

    let mut vars = Vec::new();
    for line in section.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            vars.push(VariableSpec {
                name: caps[1].to_string(),
                description: caps[2].trim().to_string(),
            });
        }
    }
    vars
}

/// Placeholder names still present in `text` after substitution. Used for
/// status-channel warnings, never errors.
pub fn unresolved_placeholders(text: &str) -> Vec<String> {
    let re = Regex::new(r"\{\{(\w+)\}\}").unwrap();
    let mut names: Vec<String> = Vec::new();
    for caps in re.captures_iter(text) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Replace every legacy data token with the fetched tool output.
pub fn substitute_data(analysis_text: &str, data: &str) -> String {
    let mut out = analysis_text.to_string();
    for token in DATA_PLACEHOLDERS {
        out = out.replace(&format!("{{{{{}}}}}", token), data);
    }
    out
}

/// System prompt for every chat call: the role document, a blank line, then
/// the rules document. Missing documents contribute nothing.
pub fn build_system_prompt(context_dir: &Path) -> String {
    let mut parts = Vec::new();
    for name in ["Role.md", "Rules.md"] {
        if let Ok(text) = fs::read_to_string(context_dir.join(name)) {
            let text = text.trim();
            if !text.is_empty() {
                parts.push(text.to_string());
            }
        }
    }
    parts.join("\n\n")
}
