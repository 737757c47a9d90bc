//! Path normalisation and segment-based classification.
//!
//! Classification never looks at raw substrings: a path is split into
//! segments after lexical normalisation, and a root matches only as a
//! contiguous run of whole segments.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Replaces `\` with `/` so both separator styles split identically.
#[must_use]
pub fn unify_separators(raw: &str) -> String {
    raw.replace('\\', "/")
}

/// Resolves `.` and `..` without touching the filesystem.
///
/// `..` above the root of an absolute path is dropped; on a relative path it
/// is kept, since there is nothing to pop.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Expands a leading `~` against `home`.
#[must_use]
pub fn expand_home(raw: &str, home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) if raw == "~" => home.to_path_buf(),
        Some(home) => raw
            .strip_prefix("~/")
            .map_or_else(|| PathBuf::from(raw), |rest| home.join(rest)),
        None => PathBuf::from(raw),
    }
}

/// Produces the lexical, absolute (when `base` is known) form of a tool path.
#[must_use]
pub fn absolutize(raw: &str, base: Option<&Path>, home: Option<&Path>) -> PathBuf {
    let expanded = expand_home(&unify_separators(raw), home);
    match base {
        Some(base) if expanded.is_relative() => normalize(&base.join(expanded)),
        _ => normalize(&expanded),
    }
}

/// Symlink hops followed before a path is treated as a loop.
const MAX_LINK_HOPS: usize = 40;

/// Resolves symlinks component by component.
///
/// Components that do not exist yet are kept lexically. Every link in the
/// chain is followed through its target, so a later `..` applies to the link
/// target rather than the link. A dangling link resolves to the lexical form
/// of its target.
///
/// # Errors
///
/// Fails on a symlink loop or when a link cannot be read. Callers treat that
/// as unclassifiable.
pub fn resolve_symlinks(path: &Path) -> io::Result<PathBuf> {
    let unified = PathBuf::from(unify_separators(&path.to_string_lossy()));
    let mut hops = 0;
    resolve_onto(PathBuf::new(), &unified, &mut hops)
}

fn resolve_onto(mut resolved: PathBuf, path: &Path, hops: &mut usize) -> io::Result<PathBuf> {
    if path.has_root() {
        resolved = PathBuf::new();
    }
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if resolved.file_name().is_some() {
                    resolved.pop();
                } else if !resolved.has_root() {
                    resolved.push("..");
                }
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                match fs::symlink_metadata(&candidate) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        *hops += 1;
                        if *hops > MAX_LINK_HOPS {
                            return Err(io::Error::other(format!(
                                "too many levels of symbolic links at {}",
                                candidate.display()
                            )));
                        }
                        let target = fs::read_link(&candidate)?;
                        resolved = resolve_onto(resolved, &target, hops)?;
                    }
                    _ => resolved = candidate,
                }
            }
        }
    }
    Ok(resolved)
}

/// Returns the normal segments of `path`.
#[must_use]
pub fn segments(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Splits a configured directory like `.claude/skills` into segments.
#[must_use]
pub fn split_root(raw: &str) -> Vec<String> {
    unify_separators(raw)
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(str::to_owned)
        .collect()
}

fn contains_run(haystack: &[String], needle: &[String], fold_case: bool) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| {
        window.iter().zip(needle).all(|(have, want)| {
            if fold_case {
                have.eq_ignore_ascii_case(want)
            } else {
                have == want
            }
        })
    })
}

/// Where a path lands relative to the skill trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Inside the live skills tree.
    Active,
    /// Inside the draft skills tree and not the live one.
    Draft,
    /// Neither.
    Other,
}

/// Segment runs identifying the live and draft skill trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillRoots {
    active: Vec<String>,
    draft: Vec<String>,
}

impl SkillRoots {
    /// Builds roots from directory strings such as `.claude/skills`.
    #[must_use]
    pub fn new(active: &str, draft: &str) -> Self {
        Self {
            active: split_root(active),
            draft: split_root(draft),
        }
    }

    /// Returns true when both roots have at least one segment.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.active.is_empty() && !self.draft.is_empty() && self.active != self.draft
    }

    /// Classifies a normalised path.
    ///
    /// The live tree is matched ignoring ASCII case so a case-insensitive
    /// filesystem cannot alias it; the draft tree must match exactly.
    #[must_use]
    pub fn classify(&self, path: &Path) -> PathClass {
        let segments = segments(path);
        if contains_run(&segments, &self.active, true) {
            PathClass::Active
        } else if contains_run(&segments, &self.draft, false) {
            PathClass::Draft
        } else {
            PathClass::Other
        }
    }
}
