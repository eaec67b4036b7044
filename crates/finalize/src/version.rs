//! Version substrings in artifact file names.
//!
//! A version is `MAJOR.MINOR.PATCH`, optionally followed by
//! `-[<tag>-]<build>-<revision>` (for example `1.2.3-preview-4-5` or
//! `1.2.3-4-5`). The same
//! parser drives both the stale-marker purge and the `Latest` rename so the
//! two can never disagree about what counts as a version.

use std::borrow::Cow;
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

/// Token substituted for the version when promoting to latest.
pub const LATEST_TOKEN: &str = "Latest";

fn version_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?P<version>\d+\.\d+\.\d+)(?:-(?:(?P<tag>[^-/\s]+)-)?(?P<build>\d+)-(?P<revision>\d+))?",
        )
        .unwrap_or_else(|e| unreachable!("version pattern is a valid regex: {e}"))
    })
}

/// Prerelease suffix of a version: an optional tag plus build/revision
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerelease<'a> {
    pub tag: Option<&'a str>,
    pub build: &'a str,
    pub revision: &'a str,
}

/// One version occurrence inside a larger string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMatch<'a> {
    /// Byte range of the whole match in the searched string
    pub span: Range<usize>,
    /// Entire matched text, suffix included
    pub text: &'a str,
    /// `MAJOR.MINOR.PATCH` part
    pub core: &'a str,
    /// Optional `-[<tag>-]<build>-<revision>` part
    pub prerelease: Option<Prerelease<'a>>,
}

/// Every version occurrence in `name`, left to right.
pub fn find_versions(name: &str) -> impl Iterator<Item = VersionMatch<'_>> + '_ {
    version_regex().captures_iter(name).filter_map(|caps| {
        let whole = caps.get(0)?;
        let core = caps.name("version")?.as_str();
        let prerelease = match (caps.name("build"), caps.name("revision")) {
            (Some(build), Some(revision)) => Some(Prerelease {
                tag: caps.name("tag").map(|tag| tag.as_str()),
                build: build.as_str(),
                revision: revision.as_str(),
            }),
            _ => None,
        };
        Some(VersionMatch {
            span: whole.range(),
            text: whole.as_str(),
            core,
            prerelease,
        })
    })
}

/// First version occurrence in `name`.
#[must_use]
pub fn find_version(name: &str) -> Option<VersionMatch<'_>> {
    find_versions(name).next()
}

/// Replace every version occurrence in `name` with `replacement`.
#[must_use]
pub fn replace_versions<'a>(name: &'a str, replacement: &str) -> Cow<'a, str> {
    let mut out = String::new();
    let mut cursor = 0;
    let mut matched = false;
    for found in find_versions(name) {
        out.push_str(&name[cursor..found.span.start]);
        out.push_str(replacement);
        cursor = found.span.end;
        matched = true;
    }
    if !matched {
        return Cow::Borrowed(name);
    }
    out.push_str(&name[cursor..]);
    Cow::Owned(out)
}

/// `name` with every version occurrence removed.
#[must_use]
pub fn strip_versions(name: &str) -> Cow<'_, str> {
    replace_versions(name, "")
}

/// True when `name` consists of nothing but version text.
///
/// `1.2.3` and `1.2.3-preview-4-5` qualify; `1.2.3.json` and
/// `notaversion.txt` do not.
#[must_use]
pub fn is_bare_version(name: &str) -> bool {
    !name.is_empty() && strip_versions(name).is_empty()
}

/// Name a versioned artifact takes under the `Latest` folder.
#[must_use]
pub fn latest_name(file_name: &str) -> Cow<'_, str> {
    replace_versions(file_name, LATEST_TOKEN)
}
