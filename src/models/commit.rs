use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a file was touched by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Added => "added",
            FileStatus::Modified => "modified",
            FileStatus::Deleted => "deleted",
            FileStatus::Renamed => "renamed",
        }
    }

    /// Map a GitHub file status. `removed`, `copied` and `changed` are folded
    /// into the closest of the four stored states.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "added" | "copied" => Some(FileStatus::Added),
            "modified" | "changed" | "unchanged" => Some(FileStatus::Modified),
            "deleted" | "removed" => Some(FileStatus::Deleted),
            "renamed" => Some(FileStatus::Renamed),
            _ => None,
        }
    }
}

/// One file-row of a commit. Rows of the same commit share `sha`; before
/// enrichment a commit is a single summary row with an empty `filename`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub sha: String,
    pub repository_id: String,
    pub contributor_id: Option<String>,
    pub pull_request_id: Option<String>,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub filename: String,
    pub status: FileStatus,
    pub additions: i32,
    pub deletions: i32,
    pub patch: Option<String>,
    pub is_merge_commit: bool,
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
}

impl Commit {
    pub fn is_summary_row(&self) -> bool {
        self.filename.is_empty()
    }

    /// Lowercased extension of the changed file, if any.
    pub fn file_extension(&self) -> Option<String> {
        file_extension(&self.filename)
    }

    /// Language of the changed file, derived from its extension.
    pub fn language(&self) -> Option<String> {
        self.file_extension().map(|ext| language_for_extension(&ext))
    }
}

/// Lowercased extension of a path; `None` for dotfiles and bare names.
pub fn file_extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Language name for a lowercased file extension. Unknown extensions are
/// reported as themselves so they still count as a distinct bucket.
pub fn language_for_extension(ext: &str) -> String {
    let name = match ext {
        "rs" => "Rust",
        "py" | "pyi" => "Python",
        "js" | "mjs" | "cjs" | "jsx" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "go" => "Go",
        "java" => "Java",
        "kt" | "kts" => "Kotlin",
        "rb" => "Ruby",
        "c" | "h" => "C",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "C++",
        "cs" => "C#",
        "swift" => "Swift",
        "php" => "PHP",
        "scala" => "Scala",
        "sh" | "bash" | "zsh" => "Shell",
        "html" | "htm" => "HTML",
        "css" | "scss" | "sass" | "less" => "CSS",
        "md" | "markdown" => "Markdown",
        "json" => "JSON",
        "yml" | "yaml" => "YAML",
        "toml" => "TOML",
        "sql" => "SQL",
        other => return other.to_string(),
    };
    name.to_string()
}
