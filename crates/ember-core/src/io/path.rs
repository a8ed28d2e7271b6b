// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lazily resolved file paths used as the identity of in-flight requests.
//!
//! A [`RequestPath`] stores the path exactly as it was given and only resolves
//! it (alias expansion, separator and `.`/`..` normalisation, hashing) the first
//! time its absolute form, relative form, hash, or validity is asked for. Most
//! requests are compared and hashed far more often than their string form is
//! consumed, so the resolution is cached and never recomputed until the path
//! is re-initialised.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Hash of a path that has not been resolved yet.
pub const INVALID_PATH_HASH: u64 = u64::MAX;
/// Hash of an empty or unresolvable path.
pub const EMPTY_PATH_HASH: u64 = 0;

const ALIAS_MARKER: char = '@';

/// Errors produced while resolving a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// The path starts with an alias that is not registered.
    UnknownAlias(String),
    /// A `..` segment climbs above the root of the path.
    EscapesRoot(String),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::UnknownAlias(alias) => write!(f, "Unknown path alias '{alias}'"),
            PathError::EscapesRoot(path) => write!(f, "Path '{path}' escapes its root"),
        }
    }
}

impl std::error::Error for PathError {}

/// A table of `@alias@` tokens and the roots they expand to.
#[derive(Debug, Clone, Default)]
pub struct PathAliases {
    aliases: HashMap<String, String>,
}

impl PathAliases {
    /// Creates an empty alias table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an alias. `alias` may be given with or without
    /// its surrounding `@` markers.
    pub fn set(&mut self, alias: &str, root: impl AsRef<str>) -> Result<(), PathError> {
        let root = normalize(root.as_ref())?;
        self.aliases.insert(strip_markers(alias).to_owned(), root);
        Ok(())
    }

    /// Removes an alias, returning its root.
    pub fn remove(&mut self, alias: &str) -> Option<String> {
        self.aliases.remove(strip_markers(alias))
    }

    /// Returns the root an alias expands to.
    pub fn get(&self, alias: &str) -> Option<&str> {
        self.aliases.get(strip_markers(alias)).map(String::as_str)
    }

    /// Returns the number of registered aliases.
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    /// Returns `true` if no aliases are registered.
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Returns the offset just past a leading `@alias@` token (and the separator
    /// that follows it), or 0 if `path` does not start with an alias.
    pub fn find_alias_offset(path: &str) -> usize {
        if !path.starts_with(ALIAS_MARKER) {
            return 0;
        }
        match path[1..].find(ALIAS_MARKER) {
            Some(end) => {
                let offset = end + 2;
                match path.as_bytes().get(offset) {
                    Some(b'/') | Some(b'\\') => offset + 1,
                    _ => offset,
                }
            }
            None => 0,
        }
    }

    /// Expands a leading alias and normalises the result.
    pub fn resolve(&self, path: &str) -> Result<String, PathError> {
        let offset = Self::find_alias_offset(path);
        if offset == 0 {
            return normalize(path);
        }

        let token = path[..offset].trim_end_matches(['/', '\\']);
        let alias = strip_markers(token);
        let root = self
            .aliases
            .get(alias)
            .ok_or_else(|| PathError::UnknownAlias(alias.to_owned()))?;

        let remainder = &path[offset..];
        if remainder.is_empty() {
            Ok(root.clone())
        } else {
            normalize(&format!("{root}/{remainder}"))
        }
    }

    /// Returns the offset of the part of `absolute` that follows the longest
    /// alias root it lives under, or 0 if it lives under none.
    pub fn relative_offset(&self, absolute: &str) -> usize {
        self.aliases
            .values()
            .filter_map(|root| {
                let rest = absolute.strip_prefix(root.as_str())?;
                if rest.is_empty() {
                    Some(root.len())
                } else if rest.starts_with('/') {
                    Some(root.len() + 1)
                } else if root.ends_with('/') {
                    Some(root.len())
                } else {
                    None
                }
            })
            .max()
            .unwrap_or(0)
    }
}

fn strip_markers(alias: &str) -> &str {
    alias.trim_matches(ALIAS_MARKER)
}

/// Unifies separators to `/` and folds `.` and `..` segments.
fn normalize(path: &str) -> Result<String, PathError> {
    let unified = path.replace('\\', "/");
    let rooted = unified.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                let is_drive = segments.len() == 1 && !rooted && segments[0].ends_with(':');
                if segments.is_empty() || is_drive {
                    return Err(PathError::EscapesRoot(path.to_owned()));
                }
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut normalized = String::with_capacity(unified.len());
    if rooted {
        normalized.push('/');
    }
    normalized.push_str(&segments.join("/"));
    Ok(normalized)
}

fn hash_path(absolute: &str) -> u64 {
    let state = ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    );
    match state.hash_one(absolute) {
        EMPTY_PATH_HASH | INVALID_PATH_HASH => 1,
        hash => hash,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathOrigin {
    Relative,
    Absolute,
}

#[derive(Debug, Clone)]
struct Resolution {
    absolute: String,
    relative_offset: usize,
    hash: u64,
}

impl Resolution {
    fn empty() -> Self {
        Self {
            absolute: String::new(),
            relative_offset: 0,
            hash: EMPTY_PATH_HASH,
        }
    }
}

/// A file path whose resolution is deferred until first use.
///
/// Two `RequestPath`s compare (and hash) equal when they resolve to the same
/// absolute path, regardless of the alias they were written with.
#[derive(Clone)]
pub struct RequestPath {
    path: String,
    origin: PathOrigin,
    aliases: Option<Arc<PathAliases>>,
    resolved: OnceLock<Resolution>,
}

impl RequestPath {
    /// Creates a path that is already absolute (it is still normalised).
    pub fn from_absolute(path: impl Into<String>) -> Self {
        let mut request_path = Self::empty();
        request_path.init_from_absolute_path(path.into());
        request_path
    }

    /// Creates a path that may start with an alias from `aliases`.
    pub fn from_relative(path: impl Into<String>, aliases: Arc<PathAliases>) -> Self {
        let mut request_path = Self::empty();
        request_path.aliases = Some(aliases);
        request_path.init_from_relative_path(path.into());
        request_path
    }

    /// An empty path. It is never valid.
    pub fn empty() -> Self {
        Self {
            path: String::new(),
            origin: PathOrigin::Absolute,
            aliases: None,
            resolved: OnceLock::from(Resolution::empty()),
        }
    }

    /// Replaces the stored path with a relative (alias-prefixed) one and drops
    /// the cached resolution.
    pub fn init_from_relative_path(&mut self, path: String) {
        self.path = path;
        self.origin = PathOrigin::Relative;
        self.invalidate();
    }

    /// Replaces the stored path with an absolute one and drops the cached
    /// resolution.
    pub fn init_from_absolute_path(&mut self, path: String) {
        self.path = path;
        self.origin = PathOrigin::Absolute;
        self.invalidate();
    }

    /// Attaches the alias table used during resolution.
    pub fn with_aliases(mut self, aliases: Arc<PathAliases>) -> Self {
        self.aliases = Some(aliases);
        self.invalidate();
        self
    }

    fn invalidate(&mut self) {
        self.resolved = OnceLock::new();
        if self.path.is_empty() {
            // Empty paths never need resolving.
            let _ = self.resolved.set(Resolution::empty());
        }
    }

    fn resolve_path(&self) -> &Resolution {
        self.resolved.get_or_init(|| {
            let aliases = self.aliases.as_deref();
            let resolved = match aliases {
                Some(aliases) => aliases.resolve(&self.path),
                None => match PathAliases::find_alias_offset(&self.path) {
                    0 => normalize(&self.path),
                    offset => Err(PathError::UnknownAlias(self.path[..offset].to_owned())),
                },
            };

            match resolved {
                Ok(absolute) if !absolute.is_empty() => {
                    let relative_offset = aliases
                        .map(|aliases| aliases.relative_offset(&absolute))
                        .unwrap_or(0);
                    let hash = hash_path(&absolute);
                    log::trace!("Resolved request path '{}' to '{absolute}'.", self.path);
                    Resolution {
                        absolute,
                        relative_offset,
                        hash,
                    }
                }
                Ok(_) => Resolution::empty(),
                Err(error) => {
                    log::debug!("Failed to resolve request path '{}': {error}", self.path);
                    Resolution::empty()
                }
            }
        })
    }

    /// The path exactly as it was stored.
    pub fn as_stored(&self) -> &str {
        &self.path
    }

    /// Returns `true` if the path was initialised from a relative path.
    pub fn is_relative(&self) -> bool {
        self.origin == PathOrigin::Relative
    }

    /// The resolved absolute path, or an empty string if it cannot be resolved.
    pub fn absolute_path(&self) -> &str {
        &self.resolve_path().absolute
    }

    /// The part of the absolute path below the alias root it lives under.
    pub fn relative_path(&self) -> &str {
        let resolution = self.resolve_path();
        &resolution.absolute[resolution.relative_offset..]
    }

    /// The hash of the resolved absolute path.
    ///
    /// Returns [`EMPTY_PATH_HASH`] for empty or unresolvable paths and never
    /// returns [`INVALID_PATH_HASH`].
    pub fn path_hash(&self) -> u64 {
        self.resolve_path().hash
    }

    /// Returns `true` if the path is non-empty and resolves.
    pub fn is_valid(&self) -> bool {
        self.path_hash() != EMPTY_PATH_HASH
    }

    /// Returns `true` once the resolution has been computed and cached.
    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }
}

impl Default for RequestPath {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for RequestPath {
    fn eq(&self, other: &Self) -> bool {
        self.path_hash() == other.path_hash() && self.absolute_path() == other.absolute_path()
    }
}

impl Eq for RequestPath {}

impl Hash for RequestPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.path_hash());
    }
}

impl fmt::Debug for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPath")
            .field("path", &self.path)
            .field("relative", &self.is_relative())
            .field("resolved", &self.resolved.get().map(|r| r.absolute.as_str()))
            .finish()
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
