//! Filename patterns and z-stack grouping.
//!
//! A pattern is literal text with numeric placeholders, e.g.
//! `img_r{rrr}_c{c+}_z{zzz}.zvol`:
//!
//! - `{vvv}` is variable `v` with exactly three digits
//! - `{v+}` is variable `v` with one or more digits
//!
//! One variable is the z axis (default `z`). Files whose other variables all
//! agree form one group, ordered by z. The group's output name is the pattern
//! rendered with the z placeholder collapsed to `(<min>-<max>)`.

use crate::error::{Result, StackError};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Default name of the z variable
pub const DEFAULT_Z_AXIS: char = 'z';

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable { name: char, width: Option<usize> },
}

/// Compiled filename pattern
#[derive(Debug, Clone)]
pub struct FilePattern {
    source: String,
    segments: Vec<Segment>,
    regex: Regex,
    z_axis: char,
}

impl FilePattern {
    /// Compile a pattern using `z` as the stacking axis
    pub fn parse(pattern: &str) -> Result<Self> {
        Self::with_z_axis(pattern, DEFAULT_Z_AXIS)
    }

    /// Compile a pattern with an explicit stacking axis variable
    pub fn with_z_axis(pattern: &str, z_axis: char) -> Result<Self> {
        let invalid = |reason: String| StackError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => body.push(c),
                            None => return Err(invalid("unclosed '{'".to_string())),
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(&body).map_err(invalid)?);
                }
                '}' => return Err(invalid("unmatched '}'".to_string())),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let mut seen = Vec::new();
        let mut expr = String::from("^");
        for segment in &segments {
            match segment {
                Segment::Literal(text) => expr.push_str(&regex::escape(text)),
                Segment::Variable { name, width } => {
                    if seen.contains(name) {
                        return Err(invalid(format!("variable '{}' appears twice", name)));
                    }
                    seen.push(*name);
                    let written = match width {
                        Some(n) => write!(expr, "(?P<{}>[0-9]{{{}}})", name, n),
                        None => write!(expr, "(?P<{}>[0-9]+)", name),
                    };
                    written.map_err(|e| invalid(e.to_string()))?;
                }
            }
        }
        expr.push('$');

        if !seen.contains(&z_axis) {
            return Err(invalid(format!("z variable '{}' is missing", z_axis)));
        }

        let regex = Regex::new(&expr).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            segments,
            regex,
            z_axis,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn z_axis(&self) -> char {
        self.z_axis
    }

    /// Variable names in pattern order
    pub fn variables(&self) -> Vec<char> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Variable { name, .. } => Some(*name),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Extract variable values from a filename
    pub fn match_name(&self, name: &str) -> Result<BTreeMap<char, u64>> {
        let mismatch = || StackError::PatternMismatch {
            name: name.to_string(),
            pattern: self.source.clone(),
        };
        let captures = self.regex.captures(name).ok_or_else(mismatch)?;

        let mut values = BTreeMap::new();
        for var in self.variables() {
            let text = captures
                .name(&var.to_string())
                .ok_or_else(mismatch)?
                .as_str();
            let value = text.parse::<u64>().map_err(|_| mismatch())?;
            values.insert(var, value);
        }
        Ok(values)
    }

    /// Parse a path into a slice file
    pub fn slice_file(&self, path: &Path) -> Result<SliceFile> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut identity = self.match_name(&name)?;
        let z = identity.remove(&self.z_axis).unwrap_or_default();
        Ok(SliceFile {
            path: path.to_path_buf(),
            z,
            identity,
        })
    }

    /// Render the output name for a group covering `z_range`
    pub fn output_name(&self, key: &BTreeMap<char, u64>, z_range: (u64, u64)) -> String {
        let mut name = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Variable { name: var, width } => {
                    let width = width.unwrap_or(0);
                    if *var == self.z_axis {
                        let _ = write!(
                            name,
                            "({:0w$}-{:0w$})",
                            z_range.0,
                            z_range.1,
                            w = width
                        );
                    } else {
                        let value = key.get(var).copied().unwrap_or_default();
                        let _ = write!(name, "{:0w$}", value, w = width);
                    }
                }
            }
        }
        name
    }
}

fn parse_placeholder(body: &str) -> std::result::Result<Segment, String> {
    let (letters, variable_width) = match body.strip_suffix('+') {
        Some(rest) => (rest, true),
        None => (body, false),
    };

    let mut chars = letters.chars();
    let name = chars
        .next()
        .ok_or_else(|| "empty placeholder '{}'".to_string())?;
    if !name.is_ascii_alphabetic() {
        return Err(format!("placeholder '{{{}}}' must name a letter", body));
    }
    if chars.any(|c| c != name) {
        return Err(format!(
            "placeholder '{{{}}}' must repeat a single letter",
            body
        ));
    }

    let count = letters.chars().count();
    if variable_width && count != 1 {
        return Err(format!(
            "placeholder '{{{}}}' mixes fixed width and '+'",
            body
        ));
    }
    Ok(Segment::Variable {
        name,
        width: if variable_width { None } else { Some(count) },
    })
}

/// One input slice and its position in the naming scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceFile {
    pub path: PathBuf,
    /// Value of the z variable
    pub z: u64,
    /// Values of every other variable
    pub identity: BTreeMap<char, u64>,
}

/// Slices sharing all non-z identity, ordered by z
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub key: BTreeMap<char, u64>,
    pub files: Vec<SliceFile>,
    pub output_name: String,
}

impl Group {
    /// Lowest and highest z value in the group
    pub fn z_range(&self) -> Option<(u64, u64)> {
        Some((self.files.first()?.z, self.files.last()?.z))
    }

    /// Short human-readable key such as `c=1,r=3`
    pub fn label(&self) -> String {
        if self.key.is_empty() {
            return self.output_name.clone();
        }
        self.key
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Partition files into z-stackable groups.
///
/// Every path must match the pattern. Groups come back sorted by key.
pub fn group_files<I, P>(pattern: &FilePattern, paths: I) -> Result<Vec<Group>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut buckets: BTreeMap<BTreeMap<char, u64>, Vec<SliceFile>> = BTreeMap::new();
    for path in paths {
        let slice = pattern.slice_file(path.as_ref())?;
        buckets.entry(slice.identity.clone()).or_default().push(slice);
    }

    let mut groups = Vec::with_capacity(buckets.len());
    for (key, mut files) in buckets {
        files.sort_by(|a, b| a.z.cmp(&b.z).then_with(|| a.path.cmp(&b.path)));
        if let Some(pair) = files.windows(2).find(|w| w[0].z == w[1].z) {
            return Err(StackError::DuplicateSlice {
                first: pair[0].path.clone(),
                second: pair[1].path.clone(),
                z: pair[0].z,
            });
        }

        let (Some(first), Some(last)) = (files.first(), files.last()) else {
            continue;
        };
        let output_name = pattern.output_name(&key, (first.z, last.z));
        groups.push(Group {
            key,
            files,
            output_name,
        });
    }
    Ok(groups)
}

/// List `dir` and group its entries. Hidden entries are ignored.
pub async fn enumerate_groups(dir: &Path, pattern: &FilePattern) -> Result<Vec<Group>> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();
    group_files(pattern, paths)
}
