//! Keyword-based request classifier (C4).
//!
//! Deterministic, lowercase-substring matching; first match wins, default
//! `Unknown`. The keyword tables are part of the spec surface, not an
//! implementation detail — they must match across implementations for
//! routing behavior to be reproducible. See [`Category::DETECTION_ORDER`]
//! for the (non-obvious) evaluation order.

/// Closed set of task categories. `Unknown` never participates in affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Coding,
    Refactoring,
    Testing,
    Documentation,
    Debugging,
    CodeReview,
    Unknown,
}

impl Category {
    /// All categories that participate in affinity, in declaration order
    /// (matches the closed enum order from the data model, §3).
    pub const ALL: [Category; 6] = [
        Category::Coding,
        Category::Refactoring,
        Category::Testing,
        Category::Documentation,
        Category::Debugging,
        Category::CodeReview,
    ];

    /// Detection evaluation order.
    ///
    /// `Coding`'s keyword table is the most generic (bare verbs like
    /// "write", "create") and overlaps with every other category's sample
    /// prompts, so it is checked last rather than first: evaluating it
    /// first would shadow more specific categories (e.g. "write unit
    /// tests" would be classified `Coding` on the word "write" before
    /// `Testing` ever gets a chance on "unit test"). Every other category
    /// keeps its declared relative order.
    const DETECTION_ORDER: [Category; 6] = [
        Category::Refactoring,
        Category::Testing,
        Category::Documentation,
        Category::Debugging,
        Category::CodeReview,
        Category::Coding,
    ];

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Category::Coding => &[
                "implement", "write", "create", "function", "method", "class",
                "interface", "struct", "algorithm", "code",
            ],
            Category::Refactoring => &[
                "refactor", "cleanup", "optimize", "simplify", "restructure",
                "rename", "extract", "consolidate", "improve", "performance",
            ],
            Category::Testing => &[
                "test", "unit test", "integration test", "test case", "mock",
                "assert", "expect", "verify", "coverage", "pytest", "jest",
            ],
            Category::Documentation => &[
                "doc", "comment", "readme", "javadoc", "docstring", "explain",
                "description", "guide", "tutorial", "example", "changelog",
            ],
            Category::Debugging => &[
                "debug", "fix", "bug", "error", "crash", "panic", "stack trace",
                "issue", "problem", "wrong", "not working", "exception",
            ],
            Category::CodeReview => &[
                "review", "approve", "feedback", "suggest", "improve",
                "quality", "standard", "best practice", "lint", "style",
                "convention",
            ],
            Category::Unknown => &[],
        }
    }
}

/// Detects a [`Category`] from free-text prompts. Stateless and cheap to
/// clone; swappable via `TaskRouter::set_category_detector`.
pub trait CategoryDetector: Send + Sync {
    fn detect(&self, prompt: &str) -> Category;
}

/// The canonical keyword-table detector described in the spec.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordCategoryDetector;

impl CategoryDetector for KeywordCategoryDetector {
    fn detect(&self, prompt: &str) -> Category {
        let lower = prompt.to_lowercase();
        for category in Category::DETECTION_ORDER {
            if category.keywords().iter().any(|kw| lower.contains(kw)) {
                return category;
            }
        }
        Category::Unknown
    }
}
