//! One-shot analysis commands.
//!
//! These pass straight through to the engine: the file contents go in as a
//! JSON payload on stdin, the engine's report comes back on stdout.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use super::{Engine, EngineCommand};
use crate::core::InvokeError;

/// Kind of one-shot analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisKind {
    /// Search the workspace around a file
    FileSearch,
    /// Review code for problems
    CodeReview,
    /// Look for likely bugs
    BugAnalysis,
    /// Suggest refactorings
    Refactor,
    /// Explain what the code does
    Explain,
    /// Generate tests
    GenerateTests,
    /// Suggest performance improvements
    OptimizePerformance,
}

impl AnalysisKind {
    /// Every kind, in menu order.
    pub const ALL: [Self; 7] = [
        Self::FileSearch,
        Self::CodeReview,
        Self::BugAnalysis,
        Self::Refactor,
        Self::Explain,
        Self::GenerateTests,
        Self::OptimizePerformance,
    ];

    /// Short name accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::FileSearch => "file-search",
            Self::CodeReview => "code-review",
            Self::BugAnalysis => "bug-analysis",
            Self::Refactor => "refactor",
            Self::Explain => "explain",
            Self::GenerateTests => "generate-tests",
            Self::OptimizePerformance => "optimize",
        }
    }

    /// Engine subcommand.
    pub fn command(self) -> &'static str {
        match self {
            Self::FileSearch => "file-search",
            Self::CodeReview => "code-review",
            Self::BugAnalysis => "bug-analysis",
            Self::Refactor => "refactor-code",
            Self::Explain => "explain-concept",
            Self::GenerateTests => "implement-feature",
            Self::OptimizePerformance => "optimize-performance",
        }
    }

    /// Whether the file contents are sent on stdin.
    pub fn takes_payload(self) -> bool {
        !matches!(self, Self::FileSearch)
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AnalysisKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|kind| kind.name() == s || kind.command() == s).ok_or_else(
            || {
                let known: Vec<_> = Self::ALL.iter().map(|k| k.name()).collect();
                format!("unknown analysis '{}' (expected one of: {})", s, known.join(", "))
            },
        )
    }
}

/// JSON payload written to the engine's stdin.
#[derive(Debug, Serialize)]
struct Payload<'a> {
    code: &'a str,
    language: &'a str,
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'static str>,
}

/// A single analysis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// What to run
    pub kind: AnalysisKind,
    /// File the analysis is about
    pub file: PathBuf,
    /// File contents, empty for kinds without a payload
    pub code: String,
    /// Language inferred from the file extension
    pub language: String,
}

impl AnalysisRequest {
    /// Build a request for `file`, reading its contents when the kind needs them.
    pub fn from_file(kind: AnalysisKind, file: impl Into<PathBuf>) -> std::io::Result<Self> {
        let file = file.into();
        let code =
            if kind.takes_payload() { std::fs::read_to_string(&file)? } else { String::new() };
        let language = language_for(&file).to_string();
        Ok(Self { kind, file, code, language })
    }

    /// Engine arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.kind.command().to_string()];
        if self.kind.takes_payload() {
            args.push("--stdin".to_string());
        } else {
            args.push(self.file.display().to_string());
        }
        args
    }

    /// JSON payload for stdin, if this kind takes one.
    pub fn payload(&self) -> Option<String> {
        if !self.kind.takes_payload() {
            return None;
        }

        let payload = Payload {
            code: &self.code,
            language: &self.language,
            file: self.file.display().to_string(),
            task: (self.kind == AnalysisKind::GenerateTests).then_some("generate_tests"),
        };

        // Only strings are serialized, which cannot fail.
        serde_json::to_string(&payload).ok()
    }
}

/// Language id for a file, from its extension.
pub fn language_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_lowercase();

    match ext.as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "sh" | "bash" => "shellscript",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "md" => "markdown",
        _ => "plaintext",
    }
}

/// Engine report for one analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    /// Report text
    pub output: String,
    /// Diagnostic lines the engine wrote to stderr
    pub warnings: Vec<String>,
}

/// Run one analysis.
///
/// A non-zero exit is an error; stderr from a successful run is kept as
/// warnings.
pub async fn run_analysis(
    engine: &dyn Engine,
    request: AnalysisRequest,
) -> Result<AnalysisReport, InvokeError> {
    let kind = request.kind;
    let output = engine.call(&EngineCommand::Analyze(request)).await?.check()?;

    let warnings: Vec<String> =
        output.stderr.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect();
    if !warnings.is_empty() {
        tracing::debug!(analysis = %kind, count = warnings.len(), "engine reported warnings");
    }

    Ok(AnalysisReport { output: output.stdout, warnings })
}
