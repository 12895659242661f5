//! Path and label heuristics behind [`PrAnalysis`] and [`IssueAnalysis`].
//!
//! Both analyses are pure functions of their snapshot. Staleness is measured
//! against the snapshot's own `snapshot_at`, never the wall clock.

use serde::{Deserialize, Serialize};

use crate::models::{
    Complexity, IssueContext, PrContext, Priority, RiskLevel, SecurityConcern, Severity, TaskType,
};

/// Label that opts a pull request into auto-merge.
pub const AUTO_MERGE_LABEL: &str = "auto-merge";

const SMALL_DIFF: u64 = 100;
const LARGE_DIFF: u64 = 500;
const MANY_FILES: usize = 20;

/// Derived judgment over a pull request snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrAnalysis {
    pub requires_security_review: bool,
    pub requires_code_review: bool,
    pub requires_testing: bool,
    pub requires_documentation: bool,
    pub requires_performance: bool,
    pub requires_deployment: bool,
    pub languages: Vec<String>,
    pub complexity: Complexity,
    pub risk_level: RiskLevel,
    pub security_concerns: Vec<SecurityConcern>,
    pub source_files: Vec<String>,
    pub test_files: Vec<String>,
    pub documentation_files: Vec<String>,
    pub performance_paths: Vec<String>,
    pub deployment_files: Vec<String>,
    pub estimated_minutes: u32,
    pub auto_merge_eligible: bool,
    pub stale: bool,
}

impl PrAnalysis {
    pub fn requires(&self, task_type: TaskType) -> bool {
        match task_type {
            TaskType::SecurityReview => self.requires_security_review,
            TaskType::CodeReview => self.requires_code_review,
            TaskType::Testing => self.requires_testing,
            TaskType::Documentation => self.requires_documentation,
            TaskType::Performance => self.requires_performance,
            TaskType::Deployment => self.requires_deployment,
        }
    }

    /// Required categories in the fixed type order.
    pub fn required(&self) -> Vec<TaskType> {
        TaskType::ALL
            .iter()
            .copied()
            .filter(|t| self.requires(*t))
            .collect()
    }

    /// Turn every category on, as `/full-review` asks.
    pub fn force_all(&mut self) {
        self.requires_security_review = true;
        self.requires_code_review = true;
        self.requires_testing = true;
        self.requires_documentation = true;
        self.requires_performance = true;
        self.requires_deployment = true;
    }

    pub fn has_critical_concern(&self) -> bool {
        self.security_concerns
            .iter()
            .any(|c| c.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Feature,
    Question,
    Documentation,
    Chore,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Question => "question",
            Self::Documentation => "documentation",
            Self::Chore => "chore",
        }
    }
}

/// Derived judgment over an issue snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueAnalysis {
    pub issue_type: IssueType,
    pub priority: Priority,
    pub complexity: Complexity,
    pub estimated_minutes: u32,
    pub suggested_labels: Vec<String>,
    pub task_types: Vec<TaskType>,
}

// ── Path classification ─────────────────────────────────────────────

fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    (!stem.is_empty()).then_some(ext)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn language_of(path: &str) -> Option<&'static str> {
    let lang = match extension(path)?.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "php" => "php",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        _ => return None,
    };
    Some(lang)
}

pub fn is_test_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let name = file_name(&lower);
    lower.starts_with("tests/")
        || lower.starts_with("test/")
        || lower.contains("/tests/")
        || lower.contains("/test/")
        || lower.contains("__tests__/")
        || name.contains(".test.")
        || name.contains(".spec.")
        || name.starts_with("test_")
        || name.ends_with("_test.go")
        || name.ends_with("_test.py")
        || name.ends_with("_spec.rb")
}

pub fn is_documentation_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.starts_with("docs/")
        || lower.contains("/docs/")
        || matches!(extension(&lower), Some("md" | "mdx" | "rst" | "adoc"))
        || file_name(&lower).starts_with("readme")
        || file_name(&lower) == "changelog"
}

pub fn is_deployment_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let name = file_name(&lower);
    name == "dockerfile"
        || name.starts_with("docker-compose")
        || lower.starts_with(".github/workflows/")
        || lower.starts_with("k8s/")
        || lower.starts_with("helm/")
        || lower.starts_with("deploy/")
        || lower.contains("/deploy/")
        || matches!(extension(&lower), Some("tf" | "tfvars"))
}

pub fn is_performance_sensitive(path: &str) -> bool {
    const MARKERS: &[&str] = &[
        "bench", "perf", "cache", "query", "queries", "index", "hot_path", "pool", "migration",
    ];
    let lower = path.to_ascii_lowercase();
    if is_test_file(&lower) || is_documentation_file(&lower) {
        return false;
    }
    MARKERS.iter().any(|m| lower.contains(m))
}

/// Security-relevant traits of a single changed path.
pub fn security_concern(path: &str) -> Option<SecurityConcern> {
    let lower = path.to_ascii_lowercase();
    let name = file_name(&lower);
    let (kind, severity) = if name == ".env"
        || name.starts_with(".env.")
        || lower.contains("secret")
        || lower.contains("credential")
        || matches!(extension(&lower), Some("pem" | "key" | "p12"))
    {
        ("secrets", Severity::Critical)
    } else if lower.contains("auth")
        || lower.contains("login")
        || lower.contains("password")
        || lower.contains("session")
        || lower.contains("token")
    {
        ("authentication", Severity::High)
    } else if lower.contains("crypto") || lower.contains("encrypt") || lower.contains("signature") {
        ("cryptography", Severity::High)
    } else if matches!(
        name,
        "cargo.toml"
            | "cargo.lock"
            | "package.json"
            | "package-lock.json"
            | "yarn.lock"
            | "go.mod"
            | "go.sum"
            | "requirements.txt"
            | "gemfile"
            | "gemfile.lock"
    ) {
        ("dependencies", Severity::Medium)
    } else {
        return None;
    };
    Some(SecurityConcern {
        kind: kind.to_string(),
        file: path.to_string(),
        severity,
    })
}

fn complexity_for(diff_size: u64, files: usize) -> Complexity {
    if diff_size >= LARGE_DIFF || files > MANY_FILES {
        Complexity::High
    } else if diff_size >= SMALL_DIFF {
        Complexity::Medium
    } else {
        Complexity::Low
    }
}

fn risk_for(concerns: &[SecurityConcern], complexity: Complexity) -> RiskLevel {
    let from_concerns = concerns
        .iter()
        .map(|c| match c.severity {
            Severity::Low => RiskLevel::Low,
            Severity::Medium => RiskLevel::Medium,
            Severity::High => RiskLevel::High,
            Severity::Critical => RiskLevel::Critical,
        })
        .max()
        .unwrap_or(RiskLevel::Low);
    let from_complexity = match complexity {
        Complexity::Low => RiskLevel::Low,
        Complexity::Medium => RiskLevel::Medium,
        Complexity::High => RiskLevel::High,
    };
    from_concerns.max(from_complexity)
}

fn is_bot(login: &str) -> bool {
    login.ends_with("[bot]")
}

// ── Analyses ────────────────────────────────────────────────────────

pub fn analyze_pr(pr: &PrContext, stale_after: chrono::Duration) -> PrAnalysis {
    let mut analysis = PrAnalysis::default();

    for file in &pr.files {
        let path = file.path.as_str();
        if let Some(concern) = security_concern(path) {
            analysis.security_concerns.push(concern);
        }
        if is_test_file(path) {
            analysis.test_files.push(path.to_string());
        } else if is_documentation_file(path) {
            analysis.documentation_files.push(path.to_string());
        } else if is_deployment_file(path) {
            analysis.deployment_files.push(path.to_string());
        } else if let Some(lang) = language_of(path) {
            analysis.source_files.push(path.to_string());
            if !analysis.languages.iter().any(|l| l == lang) {
                analysis.languages.push(lang.to_string());
            }
        }
        if is_performance_sensitive(path) {
            analysis.performance_paths.push(path.to_string());
        }
    }
    analysis.languages.sort();

    analysis.complexity = complexity_for(pr.diff_size(), pr.files.len());
    analysis.risk_level = risk_for(&analysis.security_concerns, analysis.complexity);

    analysis.requires_security_review =
        !analysis.security_concerns.is_empty() || pr.has_label("security");
    analysis.requires_code_review = !analysis.source_files.is_empty();
    analysis.requires_testing =
        !analysis.source_files.is_empty() || !analysis.test_files.is_empty();
    analysis.requires_documentation = !analysis.documentation_files.is_empty();
    analysis.requires_performance =
        !analysis.performance_paths.is_empty() || pr.has_label("performance");
    analysis.requires_deployment = !analysis.deployment_files.is_empty();

    let per_category = analysis.required().len() as u32 * 5;
    analysis.estimated_minutes =
        10 + per_category + pr.files.len() as u32 * 2 + (pr.diff_size() / 50) as u32;

    analysis.auto_merge_eligible = pr.open
        && !pr.draft
        && !pr.merged
        && (pr.has_label(AUTO_MERGE_LABEL) || is_bot(&pr.author))
        && analysis.risk_level <= RiskLevel::Medium
        && !analysis.has_critical_concern();

    analysis.stale = pr.open && pr.snapshot_at - pr.updated_at >= stale_after;
    analysis
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

pub fn analyze_issue(issue: &IssueContext) -> IssueAnalysis {
    let labels: Vec<String> = issue.labels.iter().map(|l| l.to_ascii_lowercase()).collect();
    let has_label = |names: &[&str]| labels.iter().any(|l| names.contains(&l.as_str()));
    let title = issue.title.to_ascii_lowercase();
    let text = format!("{} {}", title, issue.body.to_ascii_lowercase());

    let issue_type = if has_label(&["bug", "defect"])
        || contains_any(&title, &["bug", "crash", "error", "fails", "broken"])
    {
        IssueType::Bug
    } else if has_label(&["documentation", "docs"])
        || contains_any(&title, &["docs", "documentation", "readme"])
    {
        IssueType::Documentation
    } else if has_label(&["question"]) || title.ends_with('?') || title.starts_with("how ") {
        IssueType::Question
    } else if has_label(&["chore", "maintenance"])
        || contains_any(&title, &["chore", "bump", "cleanup", "refactor"])
    {
        IssueType::Chore
    } else {
        IssueType::Feature
    };

    let priority = if has_label(&["critical", "p0", "urgent"])
        || contains_any(&text, &["security", "data loss", "outage"])
    {
        Priority::Critical
    } else if has_label(&["high", "p1"])
        || (issue_type == IssueType::Bug && contains_any(&text, &["crash", "production"]))
    {
        Priority::High
    } else if has_label(&["low", "p3"]) || issue_type == IssueType::Question {
        Priority::Low
    } else {
        Priority::Medium
    };

    let complexity = match issue.body.len() {
        0..=400 => Complexity::Low,
        401..=2000 => Complexity::Medium,
        _ => Complexity::High,
    };

    let estimated_minutes = match (issue_type, complexity) {
        (IssueType::Question, _) => 15,
        (_, Complexity::Low) => 60,
        (_, Complexity::Medium) => 240,
        (_, Complexity::High) => 960,
    };

    let task_types = match issue_type {
        IssueType::Bug => vec![TaskType::CodeReview, TaskType::Testing],
        IssueType::Feature => vec![TaskType::CodeReview],
        IssueType::Documentation => vec![TaskType::Documentation],
        IssueType::Question | IssueType::Chore => Vec::new(),
    };

    let mut suggested_labels = vec![
        issue_type.as_str().to_string(),
        format!("priority:{}", priority.as_str()),
    ];
    if complexity == Complexity::High {
        suggested_labels.push("complexity:high".into());
    }
    suggested_labels.retain(|l| !labels.contains(l));

    IssueAnalysis {
        issue_type,
        priority,
        complexity,
        estimated_minutes,
        suggested_labels,
        task_types,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangedFile;
    use crate::testing::{issue_context, pr_context};

    fn pr_with(paths: &[&str]) -> PrContext {
        let mut pr = pr_context("octo/repo", 7);
        pr.files = paths
            .iter()
            .map(|p| ChangedFile {
                path: p.to_string(),
                additions: 5,
                deletions: 1,
                status: "modified".into(),
            })
            .collect();
        pr.additions = 5 * paths.len() as u64;
        pr.deletions = paths.len() as u64;
        pr
    }

    fn days(n: i64) -> chrono::Duration {
        chrono::Duration::days(n)
    }

    #[test]
    fn test_path_classifiers() {
        assert_eq!(language_of("src/main.rs"), Some("rust"));
        assert_eq!(language_of("web/App.TSX"), Some("typescript"));
        assert_eq!(language_of(".gitignore"), None);
        assert!(is_test_file("tests/integration.rs"));
        assert!(is_test_file("web/button.test.ts"));
        assert!(!is_test_file("src/testing_utils_impl.rs"));
        assert!(is_documentation_file("README.md"));
        assert!(is_documentation_file("docs/guide/setup.txt"));
        assert!(is_deployment_file("Dockerfile"));
        assert!(is_deployment_file(".github/workflows/ci.yml"));
        assert!(is_performance_sensitive("src/cache/lru.rs"));
        assert!(!is_performance_sensitive("benches/README.md"));
    }

    #[test]
    fn test_security_concerns_by_severity() {
        assert_eq!(
            security_concern("config/secrets.yml").unwrap().severity,
            Severity::Critical
        );
        assert_eq!(
            security_concern("src/auth/middleware.rs").unwrap().severity,
            Severity::High
        );
        assert_eq!(
            security_concern("Cargo.lock").unwrap().kind,
            "dependencies"
        );
        assert!(security_concern("src/parser.rs").is_none());
    }

    #[test]
    fn test_secrets_only_change_requires_security_review_only() {
        let analysis = analyze_pr(&pr_with(&["config/secrets.yml"]), days(30));
        assert_eq!(analysis.required(), vec![TaskType::SecurityReview]);
        assert_eq!(analysis.risk_level, RiskLevel::Critical);
        assert!(analysis.has_critical_concern());
        assert!(!analysis.auto_merge_eligible);
    }

    #[test]
    fn test_source_change_requires_review_and_tests() {
        let analysis = analyze_pr(
            &pr_with(&["src/lib.rs", "src/parser.py", "tests/parse.rs", "README.md"]),
            days(30),
        );
        assert!(analysis.requires_code_review);
        assert!(analysis.requires_testing);
        assert!(analysis.requires_documentation);
        assert!(!analysis.requires_security_review);
        assert_eq!(analysis.languages, vec!["python", "rust"]);
        assert_eq!(analysis.test_files, vec!["tests/parse.rs"]);
        assert_eq!(analysis.complexity, Complexity::Low);
    }

    #[test]
    fn test_large_diff_is_high_complexity() {
        let mut pr = pr_with(&["src/lib.rs"]);
        pr.additions = 900;
        let analysis = analyze_pr(&pr, days(30));
        assert_eq!(analysis.complexity, Complexity::High);
        assert_eq!(analysis.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_auto_merge_needs_label_and_low_risk() {
        let mut pr = pr_with(&["src/lib.rs"]);
        assert!(!analyze_pr(&pr, days(30)).auto_merge_eligible);

        pr.labels.push("Auto-Merge".into());
        assert!(analyze_pr(&pr, days(30)).auto_merge_eligible);

        pr.draft = true;
        assert!(!analyze_pr(&pr, days(30)).auto_merge_eligible);
    }

    #[test]
    fn test_bot_authors_are_auto_merge_candidates() {
        let mut pr = pr_with(&["src/lib.rs"]);
        pr.author = "dependabot[bot]".into();
        assert!(analyze_pr(&pr, days(30)).auto_merge_eligible);
    }

    #[test]
    fn test_stale_measured_against_snapshot() {
        let mut pr = pr_with(&["src/lib.rs"]);
        pr.updated_at = pr.snapshot_at - days(45);
        assert!(analyze_pr(&pr, days(30)).stale);
        assert!(!analyze_pr(&pr, days(60)).stale);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let pr = pr_with(&["src/auth.rs", "src/cache.rs", "Dockerfile"]);
        assert_eq!(analyze_pr(&pr, days(30)), analyze_pr(&pr, days(30)));
    }

    #[test]
    fn test_force_all() {
        let mut analysis = analyze_pr(&pr_with(&["README.md"]), days(30));
        assert_eq!(analysis.required(), vec![TaskType::Documentation]);
        analysis.force_all();
        assert_eq!(analysis.required(), TaskType::ALL.to_vec());
    }

    #[test]
    fn test_issue_bug_triage() {
        let mut issue = issue_context("octo/repo", 3);
        issue.title = "Crash when parsing empty config".into();
        issue.body = "Happens in production every time.".into();
        let analysis = analyze_issue(&issue);
        assert_eq!(analysis.issue_type, IssueType::Bug);
        assert_eq!(analysis.priority, Priority::High);
        assert_eq!(analysis.task_types, vec![TaskType::CodeReview, TaskType::Testing]);
        assert_eq!(analysis.suggested_labels, vec!["bug", "priority:high"]);
    }

    #[test]
    fn test_issue_question_needs_no_tasks() {
        let mut issue = issue_context("octo/repo", 4);
        issue.title = "How do I configure agents?".into();
        let analysis = analyze_issue(&issue);
        assert_eq!(analysis.issue_type, IssueType::Question);
        assert_eq!(analysis.priority, Priority::Low);
        assert!(analysis.task_types.is_empty());
    }

    #[test]
    fn test_issue_existing_labels_not_suggested_again() {
        let mut issue = issue_context("octo/repo", 5);
        issue.title = "Add dark mode".into();
        issue.labels = vec!["feature".into()];
        let analysis = analyze_issue(&issue);
        assert_eq!(analysis.issue_type, IssueType::Feature);
        assert_eq!(analysis.suggested_labels, vec!["priority:medium"]);
    }
}
