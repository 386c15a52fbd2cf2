//! Argument templates for batch worker commands.
//!
//! A template is the caller-supplied argv tail for the worker command, with
//! `{offset}` and `{limit}` markers standing in for the per-batch range.
//! Resolution substitutes the markers inside string arguments; non-string
//! arguments pass through unchanged.

/// Marker replaced with the batch's first item index.
pub const OFFSET_MARKER: &str = "{offset}";

/// Marker replaced with the batch's item count.
pub const LIMIT_MARKER: &str = "{limit}";

/// One templated command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// String argument; range markers are substituted at resolve time.
    Str(String),
    /// Integer argument, passed through unchanged.
    Int(i64),
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Ordered argument template for a batch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgTemplate {
    args: Vec<ArgValue>,
}

impl ArgTemplate {
    /// Build a template from explicit argument values.
    pub fn new(args: Vec<ArgValue>) -> Self {
        Self { args }
    }

    /// Build a template from the given flags plus the range markers, e.g.
    /// `offset_limit("--offset", "--limit")` yields
    /// `--offset {offset} --limit {limit}`.
    pub fn offset_limit(offset_flag: &str, limit_flag: &str) -> Self {
        Self::new(vec![
            ArgValue::from(offset_flag),
            ArgValue::from(OFFSET_MARKER),
            ArgValue::from(limit_flag),
            ArgValue::from(LIMIT_MARKER),
        ])
    }

    /// Append one argument to the template.
    pub fn push(&mut self, arg: impl Into<ArgValue>) {
        self.args.push(arg.into());
    }

    /// Number of arguments in the template.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the template is empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Substitute the range markers for a concrete batch, producing the
    /// final argv entries for the worker command.
    pub fn resolve(&self, offset: u64, limit: u64) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match arg {
                ArgValue::Str(s) => s
                    .replace(OFFSET_MARKER, &offset.to_string())
                    .replace(LIMIT_MARKER, &limit.to_string()),
                ArgValue::Int(n) => n.to_string(),
            })
            .collect()
    }
}

impl Default for ArgTemplate {
    /// The conventional worker contract: `--offset <offset> --limit <limit>`.
    fn default() -> Self {
        Self::offset_limit("--offset", "--limit")
    }
}
