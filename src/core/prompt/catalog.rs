//! Template discovery and the custom-prompt store.
//!
//! Templates live one-per-directory under `<context>/prompts/<id>/<id>.md`.
//! Two subtrees are reserved: `custom/` holds user-saved templates (same
//! per-id layout, listed separately) and `_example/` is a format reference
//! excluded from listings. Built-in templates and the default context
//! documents are embedded in the binary and seeded onto disk at startup;
//! files the operator already has are never overwritten.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use include_dir::{Dir, DirEntry, include_dir};
use regex::Regex;
use tokio::fs;
use tracing::{info, warn};

use crate::core::error::{Error, Result};
use crate::core::present::PresenterRegistry;
use crate::core::prompt::{self, PromptTemplate};

static BUILTINS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/src/core/prompt/builtins");

/// Subtrees of the prompts directory that are not templates.
const RESERVED_DIRS: &[&str] = &["custom", "_example"];

/// Listing metadata; full bodies are only read by [`PromptCatalog::load`].
#[derive(Debug, Clone)]
pub struct PromptSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub has_presenter: bool,
    pub custom: bool,
}

pub struct PromptCatalog {
    context_dir: PathBuf,
    presenters: Arc<PresenterRegistry>,
}

impl PromptCatalog {
    pub fn new(context_dir: PathBuf, presenters: Arc<PresenterRegistry>) -> Self {
        Self {
            context_dir,
            presenters,
        }
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.context_dir.join("prompts")
    }

    fn custom_dir(&self) -> PathBuf {
        self.prompts_dir().join("custom")
    }

    /// Create the on-disk layout and seed the embedded defaults (context
    /// documents plus built-in templates). Only missing files are written so
    /// operator edits survive restarts and upgrades.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.custom_dir()).await?;

        let target = self.context_dir.clone();
        let seeded = tokio::task::spawn_blocking(move || seed_missing(&BUILTINS_DIR, &target))
            .await
            .map_err(|e| Error::internal(format!("builtin seeding task failed: {}", e)))?;
        match seeded {
            Ok(0) => {}
            Ok(count) => info!("Seeded {} builtin file(s)", count),
            Err(e) => warn!("Failed seeding builtins: {}", e),
        }
        Ok(())
    }

    pub async fn list_builtin(&self) -> Result<Vec<PromptSummary>> {
        self.scan(&self.prompts_dir(), false).await
    }

    pub async fn list_custom(&self) -> Result<Vec<PromptSummary>> {
        self.scan(&self.custom_dir(), true).await
    }

    /// One level deep: each subdirectory whose name is the template id,
    /// counted only when it holds `<id>.md`. Unreadable entries are skipped
    /// with a warning rather than failing the whole listing.
    async fn scan(&self, dir: &Path, custom: bool) -> Result<Vec<PromptSummary>> {
        let mut found = Vec::new();
        if !dir.is_dir() {
            return Ok(found);
        }

        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if !custom && RESERVED_DIRS.contains(&id.as_str()) {
                continue;
            }
            let file = path.join(format!("{}.md", id));
            if !file.is_file() {
                continue;
            }
            match fs::read_to_string(&file).await {
                Ok(text) => {
                    let (meta, _) = prompt::parse_frontmatter(&text);
                    found.push(PromptSummary {
                        name: meta.get("name").cloned().unwrap_or_else(|| id.clone()),
                        description: meta.get("description").cloned().unwrap_or_default(),
                        has_presenter: self.presenters.contains(&id),
                        custom,
                        id,
                    });
                }
                Err(e) => warn!("Skipping unreadable template at {:?}: {}", file, e),
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    /// Look a template up by id, built-ins first, then the custom store.
    /// The two namespaces are independent; no shadowing logic beyond this
    /// fixed probe order.
    pub async fn load(&self, id: &str) -> Result<Option<PromptTemplate>> {
        let Some(file) = self.find_file(id) else {
            return Ok(None);
        };
        let text = fs::read_to_string(&file).await?;
        let (meta, body) = prompt::parse_frontmatter(&text);
        Ok(Some(PromptTemplate {
            id: id.to_string(),
            name: meta.get("name").cloned().unwrap_or_else(|| id.to_string()),
            description: meta.get("description").cloned().unwrap_or_default(),
            body: body.to_string(),
        }))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.find_file(id).is_some()
    }

    fn find_file(&self, id: &str) -> Option<PathBuf> {
        if !is_safe_lookup_id(id) {
            return None;
        }
        let filename = format!("{}.md", id);
        [self.prompts_dir(), self.custom_dir()]
            .into_iter()
            .map(|dir| dir.join(id).join(&filename))
            .find(|file| file.is_file())
    }

    /// Store a template in the custom namespace. The id is derived from the
    /// display name unless given explicitly; any frontmatter already in the
    /// body is stripped and rewritten so metadata blocks never stack up
    /// across repeated edits.
    pub async fn save(
        &self,
        name: &str,
        body: &str,
        id: Option<&str>,
        description: Option<&str>,
    ) -> Result<String> {
        let id = match id {
            Some(explicit) => explicit.trim().to_string(),
            None => derive_id(name),
        };
        if !is_valid_save_id(&id) {
            return Err(Error::validation(format!(
                "invalid prompt id '{}': use lowercase letters, digits and hyphens",
                id
            )));
        }

        let (old_meta, stripped) = prompt::parse_frontmatter(body);
        let description = description
            .map(str::to_string)
            .or_else(|| old_meta.get("description").cloned())
            .unwrap_or_default();

        let mut content = format!("---\nname: {}\n", name.trim());
        if !description.is_empty() {
            content.push_str(&format!("description: {}\n", description));
        }
        content.push_str("---\n\n");
        content.push_str(stripped.trim_start());

        let dir = self.custom_dir().join(&id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(format!("{}.md", id)), content).await?;
        info!("Saved custom prompt '{}'", id);
        Ok(id)
    }

    /// Remove a custom template's whole directory. Absent is not an error.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        if !is_safe_lookup_id(id) {
            return Ok(false);
        }
        let dir = self.custom_dir().join(id);
        if !dir.is_dir() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).await?;
        info!("Deleted custom prompt '{}'", id);
        Ok(true)
    }
}

/// Lowercase the display name and collapse every non-alphanumeric run into a
/// single hyphen: `"Port Scan Digest!" -> "port-scan-digest"`.
pub fn derive_id(name: &str) -> String {
    let re = Regex::new(r"[^a-z0-9]+").unwrap();
    re.replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Saved ids are strictly kebab-case.
fn is_valid_save_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Lookups additionally accept underscores (the reserved `_example` id) but
/// never path separators.
fn is_safe_lookup_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn seed_missing(dir: &Dir<'_>, root: &Path) -> std::io::Result<usize> {
    let mut written = 0;
    for entry in dir.entries() {
        match entry {
            DirEntry::Dir(sub) => written += seed_missing(sub, root)?,
            DirEntry::File(file) => {
                let dest = root.join(file.path());
                if dest.exists() {
                    continue;
                }
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, file.contents())?;
                written += 1;
            }
        }
    }
    Ok(written)
}
