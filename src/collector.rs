//! Task collection: scan project directories for pending attachments,
//! group them by supplier code, and join against the address directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::audit::AuditLog;
use crate::config::layout;
use crate::directory::{ADDRESS_SEPARATOR, AddressDirectory};

/// Supplier codes are exactly five ASCII digits.
static SUPPLIER_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{5}$").expect("static regex"));

/// One outbound email: every pending attachment for one supplier in one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplierTask {
    pub project_folder: String,
    pub supplier_code: String,
    /// Absolute paths inside the project's pending directory. Never empty.
    pub files: Vec<PathBuf>,
    /// `;`-joined recipient list.
    pub to_addresses: String,
}

impl SupplierTask {
    /// Individual recipients, blanks removed.
    pub fn recipients(&self) -> Vec<&str> {
        self.to_addresses
            .split(ADDRESS_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Result of a collection pass.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    /// Tasks in project order, then first-seen supplier order.
    pub tasks: Vec<SupplierTask>,
    /// Supplier groups that had files but no address entry.
    pub unaddressed: usize,
}

/// Extract the supplier code from an eligible attachment filename.
///
/// Eligible names end in `.xlsx`, have at least three `_`-separated
/// segments, and carry the code in the second-to-last segment.
pub fn supplier_code(filename: &str) -> Option<&str> {
    if !filename.ends_with(layout::ATTACHMENT_EXT) || !filename.contains('_') {
        return None;
    }
    let parts: Vec<&str> = filename.split('_').collect();
    if parts.len() < 3 {
        return None;
    }
    let code = parts[parts.len() - 2];
    SUPPLIER_CODE.is_match(code).then_some(code)
}

/// Project directory names under the work root, filtered and sorted.
/// An empty filter selects every project.
pub fn project_dirs(work_root: &Path, filter: &[String]) -> Vec<String> {
    let entries = match std::fs::read_dir(work_root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(root = %work_root.display(), "Cannot read work root: {e}");
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(layout::PROJECT_SUFFIX))
        .filter(|name| filter.is_empty() || filter.iter().any(|f| f == name))
        .collect();
    names.sort();
    names
}

/// Group eligible files in a pending directory by supplier code. Files
/// are visited in name order; groups keep first-seen order.
fn supplier_files(pending: &Path) -> Vec<(String, Vec<PathBuf>)> {
    let Ok(entries) = std::fs::read_dir(pending) else {
        return Vec::new();
    };

    let mut files: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok().map(|name| (name, e.path())))
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut groups: Vec<(String, Vec<PathBuf>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (name, path) in files {
        let Some(code) = supplier_code(&name) else {
            continue;
        };
        match index.get(code) {
            Some(&i) => groups[i].1.push(path),
            None => {
                index.insert(code.to_string(), groups.len());
                groups.push((code.to_string(), vec![path]));
            }
        }
    }
    groups
}

/// A project is eligible only with both a pending and a sent directory.
fn has_layout(project_dir: &Path) -> bool {
    project_dir.join(layout::PENDING_DIR).is_dir() && project_dir.join(layout::SENT_DIR).is_dir()
}

/// Build the task list for a run.
///
/// Projects without both a pending and a sent directory are skipped with a
/// warning. Supplier codes without an address are logged and excluded.
pub fn collect_tasks(
    work_root: &Path,
    filter: &[String],
    directory: &AddressDirectory,
    audit: &AuditLog,
) -> Collection {
    let mut collection = Collection::default();

    for project in project_dirs(work_root, filter) {
        let project_dir = work_root.join(&project);
        if !has_layout(&project_dir) {
            audit.warning(format!(
                "Project '{project}' is missing '{}' or '{}', skipped.",
                layout::PENDING_DIR,
                layout::SENT_DIR
            ));
            continue;
        }

        let pending = project_dir.join(layout::PENDING_DIR);
        for (code, files) in supplier_files(&pending) {
            let Some(to_addresses) = directory.get(&code) else {
                audit.warning(format!(
                    "Supplier {code} ({project}): skipped - no email address on file."
                ));
                collection.unaddressed += 1;
                continue;
            };
            collection.tasks.push(SupplierTask {
                project_folder: project.clone(),
                supplier_code: code,
                files,
                to_addresses: to_addresses.to_string(),
            });
        }
    }

    collection
}

/// Number of tasks a run would send, for previews. Same scan and join as
/// [`collect_tasks`], without building tasks or logging.
pub fn count_pending(work_root: &Path, filter: &[String], directory: &AddressDirectory) -> usize {
    project_dirs(work_root, filter)
        .iter()
        .map(|project| work_root.join(project))
        .filter(|project_dir| has_layout(project_dir))
        .map(|project_dir| {
            supplier_files(&project_dir.join(layout::PENDING_DIR))
                .iter()
                .filter(|(code, _)| directory.contains(code))
                .count()
        })
        .sum()
}
