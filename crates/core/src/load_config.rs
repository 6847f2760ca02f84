//! Load configuration: path-pattern → open-type rules
//!
//! DiskStorage consults an ordered rule list to decide how each logical
//! file is realized in memory (mmap, locked mmap, block reads, buffered
//! reads, or fully loaded). First matching rule wins; a configurable
//! default applies when no rule matches.

/// How a file's bytes are realized when opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenType {
    /// Read-only memory mapping, paged lazily
    Mmap,
    /// Memory mapping with all pages resident
    MmapLocked,
    /// Fixed-size block reads against the backing file
    Block,
    /// Buffered positional reads against the backing file
    Buffered,
    /// Entire content loaded into an in-memory buffer
    Mem,
    /// Synthesize: re-resolve lazily against the load-config rules
    LoadConfig,
}

/// One ordered rule: pattern → open type
#[derive(Debug, Clone)]
pub struct LoadRule {
    /// Path pattern; `*` matches any run of non-separator characters,
    /// `**` matches across separators.
    pub pattern: String,
    /// Open type applied when the pattern matches
    pub open_type: OpenType,
}

impl LoadRule {
    /// Create a rule.
    pub fn new(pattern: &str, open_type: OpenType) -> Self {
        LoadRule {
            pattern: pattern.to_string(),
            open_type,
        }
    }

    /// Whether this rule's pattern matches the given logical path.
    pub fn matches(&self, path: &str) -> bool {
        glob_match(self.pattern.as_bytes(), path.as_bytes())
    }
}

fn glob_match(pattern: &[u8], path: &[u8]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(b'*') => {
            if pattern.get(1) == Some(&b'*') {
                // `**`: match any sequence including separators
                (0..=path.len()).any(|i| glob_match(&pattern[2..], &path[i..]))
            } else {
                // `*`: match any sequence of non-separator characters
                (0..=path.len())
                    .take_while(|&i| i == 0 || path[i - 1] != b'/')
                    .any(|i| glob_match(&pattern[1..], &path[i..]))
            }
        }
        Some(&c) => path.first() == Some(&c) && glob_match(&pattern[1..], &path[1..]),
    }
}

/// Ordered list of load rules with a default open type
#[derive(Debug, Clone)]
pub struct LoadConfigList {
    rules: Vec<LoadRule>,
    default_open_type: OpenType,
}

impl Default for LoadConfigList {
    fn default() -> Self {
        LoadConfigList {
            rules: Vec::new(),
            default_open_type: OpenType::Buffered,
        }
    }
}

impl LoadConfigList {
    /// Empty rule list with a `Buffered` default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule (consulted in insertion order).
    pub fn with_rule(mut self, pattern: &str, open_type: OpenType) -> Self {
        self.rules.push(LoadRule::new(pattern, open_type));
        self
    }

    /// Set the default open type used when no rule matches.
    pub fn with_default(mut self, open_type: OpenType) -> Self {
        self.default_open_type = open_type;
        self
    }

    /// Resolve a logical path to its open type. `LoadConfig` never escapes:
    /// it is the caller's request to resolve here, not a resolution result.
    pub fn resolve(&self, logical_path: &str) -> OpenType {
        for rule in &self.rules {
            if rule.matches(logical_path) {
                return rule.open_type;
            }
        }
        self.default_open_type
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
