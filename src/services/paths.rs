//! Canonical key guard shared by every entry point that builds object keys.
//!
//! All tenant-scoped keys are produced here: a caller-supplied relative path
//! is normalized first and only then joined onto the tenant root, and the
//! result is asserted to still start with that root. Nothing in this module
//! talks to a backend, so a rejection can never leak to the storage layer.

use thiserror::Error;

/// Prefix reserved for system records (move journal, completion markers).
/// Tenant roots can never live beneath it.
pub const SYSTEM_PREFIX: &str = "_system/";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path `{0}` escapes its root")]
    Traversal(String),
    #[error("path `{0}` contains a forbidden character")]
    InvalidCharacter(String),
    #[error("`{0}` is not a valid name")]
    InvalidName(String),
    #[error("key `{key}` is outside tenant root `{root}`")]
    OutsideRoot { root: String, key: String },
    #[error("`{0}` is not a valid tenant root")]
    InvalidRoot(String),
}

/// Key prefix owning every object of one tenant. Always ends in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantRoot(String);

/// A key that has passed the guard: the full bucket key plus its
/// tenant-relative remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedKey {
    full: String,
    relative: String,
}

impl TenantRoot {
    pub fn new(prefix: impl Into<String>) -> Result<Self, PathError> {
        let prefix = prefix.into();
        let normalized = normalize(&prefix).map_err(|_| PathError::InvalidRoot(prefix.clone()))?;
        if normalized.is_empty() || normalized.starts_with(SYSTEM_PREFIX) {
            return Err(PathError::InvalidRoot(prefix));
        }
        let mut root = normalized.trim_end_matches('/').to_string();
        root.push('/');
        Ok(Self(root))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `key` lies at or beneath this root.
    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(&self.0)
    }

    /// Strip the root from a full key; `None` for keys of another tenant.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.0.as_str())
    }

    /// Normalize `relative` and join it onto the root.
    pub fn scope(&self, relative: &str) -> Result<ScopedKey, PathError> {
        let relative = normalize(relative)?;
        let full = format!("{}{}", self.0, relative);
        // Every scoped key starts with the root.
        if !self.contains(&full) {
            return Err(PathError::OutsideRoot {
                root: self.0.clone(),
                key: full,
            });
        }
        Ok(ScopedKey { full, relative })
    }

    /// Like [`TenantRoot::scope`], but the result always denotes a directory
    /// (ends in `/`, or is the root itself).
    pub fn scope_directory(&self, relative: &str) -> Result<ScopedKey, PathError> {
        Ok(self.scope(relative)?.into_directory())
    }

    /// Re-validate a full key produced elsewhere (listing results, journal
    /// records) before it is used for a write.
    pub fn adopt(&self, full_key: &str) -> Result<ScopedKey, PathError> {
        let relative = self.strip(full_key).ok_or_else(|| PathError::OutsideRoot {
            root: self.0.clone(),
            key: full_key.to_string(),
        })?;
        self.scope(relative)
    }
}

impl ScopedKey {
    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// The tenant root itself, or any key ending in `/`.
    pub fn is_directory(&self) -> bool {
        self.relative.is_empty() || self.relative.ends_with('/')
    }

    pub fn into_directory(mut self) -> Self {
        if !self.is_directory() {
            self.full.push('/');
            self.relative.push('/');
        }
        self
    }

    /// Last segment of the relative path, without a trailing `/`.
    pub fn file_name(&self) -> &str {
        let trimmed = self.relative.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    /// Relative path of the parent directory (`""` at the root, otherwise
    /// ending in `/`).
    pub fn parent_relative(&self) -> &str {
        parent_of(&self.relative)
    }
}

/// Canonicalize a relative path: drop a leading `/`, collapse repeated
/// separators and `.` segments, keep a trailing `/`. Any `..` segment, a
/// backslash or a control character is rejected outright.
pub fn normalize(raw: &str) -> Result<String, PathError> {
    if raw.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(PathError::InvalidCharacter(raw.to_string()));
    }

    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(raw.to_string())),
            other => segments.push(other),
        }
    }

    let mut out = segments.join("/");
    if !out.is_empty() && raw.ends_with('/') {
        out.push('/');
    }
    Ok(out)
}

/// Validate a name that must occupy exactly one path segment (new directory
/// names, rename targets).
pub fn single_segment(name: &str) -> Result<&str, PathError> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(PathError::InvalidName(name.to_string()));
    }
    if name.contains('/') {
        return Err(PathError::InvalidName(name.to_string()));
    }
    if name.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(PathError::InvalidCharacter(name.to_string()));
    }
    Ok(name)
}

/// Reduce a client-supplied filename to its final segment, discarding any
/// directory components (either separator style).
pub fn final_segment(filename: &str) -> Result<&str, PathError> {
    let last = filename
        .rsplit(['/', '\\'])
        .find(|segment| !segment.trim().is_empty())
        .unwrap_or("")
        .trim();
    if last.is_empty() || last == "." || last == ".." || last.chars().any(char::is_control) {
        return Err(PathError::InvalidName(filename.to_string()));
    }
    Ok(last)
}

/// Parent of a normalized relative path: `"a/b/c.txt"` -> `"a/b/"`,
/// `"a/b/"` -> `"a/"`, `"c.txt"` -> `""`.
pub fn parent_of(relative: &str) -> &str {
    let trimmed = relative.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &relative[..=pos],
        None => "",
    }
}
