//! Ignore rules for task archives and build contexts
//!
//! A fixed default list plus the task root's ignore file, evaluated with
//! gitignore semantics: the last matching pattern wins and `!` re-includes.
//! Patterns without a slash match at any depth; a leading or inner `/`
//! anchors the pattern to the root; a trailing `/` matches directories only.
//! Matching a directory also matches everything beneath it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Excluded from every archive, whatever the task kind
pub const DEFAULT_IGNORES: &[&str] = &[
    "*.env",
    "*.pyc",
    ".git",
    ".gitmodules",
    ".hg",
    ".idea",
    ".next",
    ".now",
    ".npm",
    ".svn",
    ".terraform",
    ".venv",
    ".yarn",
    "__pycache__",
    "bin",
    "dist",
    "node_modules",
    "npm-debug.log",
    "out",
    // local build scratch space
    ".taskpilot",
];

#[derive(Debug, thiserror::Error)]
pub enum IgnoreError {
    #[error("reading ignore file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid ignore pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

#[derive(Debug)]
struct Rule {
    negated: bool,
    dir_only: bool,
}

/// Which part of a rule a compiled glob implements
#[derive(Debug, Clone, Copy)]
enum Target {
    /// The matched path itself
    Itself,
    /// Anything below a matched directory
    Beneath,
}

/// Compiled ignore rules
#[derive(Debug)]
pub struct IgnoreRules {
    set: GlobSet,
    globs: Vec<(usize, Target)>,
    rules: Vec<Rule>,
    patterns: Vec<String>,
    has_inclusion: bool,
}

impl IgnoreRules {
    /// Compile patterns in precedence order. Blank lines and `#` comments are skipped.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, IgnoreError> {
        let mut builder = GlobSetBuilder::new();
        let mut globs = Vec::new();
        let mut rules = Vec::new();
        let mut kept = Vec::new();

        for raw in patterns {
            let raw = raw.as_ref().trim_end();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let (negated, body) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            let (dir_only, body) = match body.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, body),
            };
            let anchored = body.contains('/');
            let body = body.trim_start_matches('/');
            if body.is_empty() {
                continue;
            }

            let base = if anchored {
                body.to_string()
            } else {
                format!("**/{body}")
            };
            let index = rules.len();
            for (glob, target) in [
                (base.clone(), Target::Itself),
                (format!("{base}/**"), Target::Beneath),
            ] {
                let compiled = GlobBuilder::new(&glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|source| IgnoreError::Pattern {
                        pattern: raw.to_string(),
                        source,
                    })?;
                builder.add(compiled);
                globs.push((index, target));
            }
            rules.push(Rule { negated, dir_only });
            kept.push(raw.to_string());
        }

        let set = builder.build().map_err(|source| IgnoreError::Pattern {
            pattern: kept.join(", "),
            source,
        })?;
        let has_inclusion = rules.iter().any(|r| r.negated);
        Ok(Self {
            set,
            globs,
            rules,
            patterns: kept,
            has_inclusion,
        })
    }

    /// Defaults followed by the lines of `root/<ignore_file>`, if present
    pub fn for_root(root: &Path, ignore_file: &str) -> Result<Self, IgnoreError> {
        let mut patterns: Vec<String> = DEFAULT_IGNORES.iter().map(|p| p.to_string()).collect();
        let path = root.join(ignore_file);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let before = patterns.len();
                patterns.extend(text.lines().map(str::to_string));
                tracing::debug!(
                    file = %path.display(),
                    rules = patterns.len() - before,
                    "using ignore file"
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(IgnoreError::Io { path, source }),
        }
        Self::new(&patterns)
    }

    /// Whether any `!` pattern exists
    pub fn has_inclusion(&self) -> bool {
        self.has_inclusion
    }

    /// Effective patterns, in precedence order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `rel` (relative to the root) is excluded
    pub fn is_ignored(&self, rel: &Path, is_dir: bool) -> bool {
        let candidate = slash_path(rel);
        let winner = self
            .set
            .matches(&candidate)
            .into_iter()
            .filter_map(|glob| {
                let (index, target) = self.globs[glob];
                let applies = match target {
                    Target::Itself => is_dir || !self.rules[index].dir_only,
                    Target::Beneath => true,
                };
                applies.then_some(index)
            })
            .max();
        match winner {
            Some(index) => !self.rules[index].negated,
            None => false,
        }
    }

    /// Whether a walk may skip `rel` and its whole subtree.
    ///
    /// Directories are never pruned while any inclusion pattern exists, since
    /// a later `!` rule might re-include something beneath them.
    pub fn should_prune(&self, rel: &Path, is_dir: bool) -> bool {
        is_dir && !self.has_inclusion && self.is_ignored(rel, true)
    }
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(patterns: &[&str]) -> IgnoreRules {
        IgnoreRules::new(patterns).unwrap()
    }

    #[test]
    fn test_defaults_match_at_any_depth() {
        let r = rules(DEFAULT_IGNORES);
        assert!(r.is_ignored(Path::new("node_modules"), true));
        assert!(r.is_ignored(Path::new("pkg/node_modules/left-pad/index.js"), false));
        assert!(r.is_ignored(Path::new("app/__pycache__"), true));
        assert!(r.is_ignored(Path::new("mod/x.pyc"), false));
        assert!(r.is_ignored(Path::new(".env"), false));
        assert!(r.is_ignored(Path::new(".taskpilot/Dockerfile"), false));
        assert!(!r.is_ignored(Path::new("main.py"), false));
        assert!(!r.is_ignored(Path::new("src/binary.rs"), false));
        assert!(!r.has_inclusion());
    }

    #[test]
    fn test_anchored_patterns_only_match_at_root() {
        let r = rules(&["/build", "docs/*.md"]);
        assert!(r.is_ignored(Path::new("build"), true));
        assert!(!r.is_ignored(Path::new("sub/build"), true));
        assert!(r.is_ignored(Path::new("docs/a.md"), false));
        assert!(!r.is_ignored(Path::new("docs/deep/a.md"), false));
    }

    #[test]
    fn test_dir_only_pattern() {
        let r = rules(&["cache/"]);
        assert!(r.is_ignored(Path::new("cache"), true));
        assert!(!r.is_ignored(Path::new("cache"), false));
        assert!(r.is_ignored(Path::new("cache/entry"), false));
    }

    #[test]
    fn test_last_match_wins_and_reinclusion() {
        let r = rules(&["dist", "!dist/keep.js"]);
        assert!(r.has_inclusion());
        assert!(r.is_ignored(Path::new("dist"), true));
        assert!(r.is_ignored(Path::new("dist/other.js"), false));
        assert!(!r.is_ignored(Path::new("dist/keep.js"), false));
    }

    #[test]
    fn test_inclusion_anywhere_disables_pruning() {
        let plain = rules(&["dist"]);
        assert!(plain.should_prune(Path::new("dist"), true));
        assert!(!plain.should_prune(Path::new("main.js"), false));

        let with_inclusion = rules(&["dist", "!unrelated.txt"]);
        assert!(!with_inclusion.should_prune(Path::new("dist"), true));
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        let r = rules(&["# comment", "", "*.log   "]);
        assert_eq!(r.patterns(), ["*.log"]);
        assert!(r.is_ignored(Path::new("a/b.log"), false));
    }

    #[test]
    fn test_for_root_appends_ignore_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".taskpilotignore"), "secrets/\n!bin\n").unwrap();
        let r = IgnoreRules::for_root(dir.path(), ".taskpilotignore").unwrap();
        assert!(r.is_ignored(Path::new("secrets/key"), false));
        assert!(!r.is_ignored(Path::new("bin"), true));
        assert_eq!(r.patterns().len(), DEFAULT_IGNORES.len() + 2);
    }
}
