//! Path splitting and managed prefix matching

use anyhow::Result;

/// Split a filesystem path or URI into its components
///
/// - `"/a/b/c"` becomes `["a", "b", "c"]`
/// - scheme and authority are dropped: `"hdfs://nn:8020/a/b"` becomes `["a", "b"]`
/// - empty components (`//`, trailing `/`) are skipped
///
/// Returns `None` for relative paths.
pub fn split_path(path: &str) -> Option<Vec<&str>> {
    let path = match path.find("://") {
        Some(idx) => {
            let rest = &path[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => path,
    };

    if !path.starts_with('/') {
        return None;
    }

    Some(path.split('/').filter(|c| !c.is_empty()).collect())
}

/// Join components back into an absolute path
pub fn join_components<S: AsRef<str>>(components: &[S]) -> String {
    if components.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for component in components {
        out.push('/');
        out.push_str(component.as_ref());
    }
    out
}

/// The set of path prefixes this system is responsible for
///
/// Matching is per component, so `/wh` manages `/wh/db1.db` but not `/wharf`.
/// Anything outside every prefix is invisible to snapshots, deltas and replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefixes {
    prefixes: Vec<Vec<String>>,
}

impl PathPrefixes {
    /// Build from absolute prefix strings
    pub fn new<I, S>(prefixes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for prefix in prefixes {
            let prefix = prefix.as_ref();
            let components = split_path(prefix)
                .ok_or_else(|| anyhow::anyhow!("Managed prefix must be absolute: {}", prefix))?;
            parsed.push(components.into_iter().map(str::to_string).collect());
        }
        Ok(Self { prefixes: parsed })
    }

    /// Check if a component sequence falls under any managed prefix
    pub fn manages<S: AsRef<str>>(&self, components: &[S]) -> bool {
        self.prefixes.iter().any(|prefix| {
            prefix.len() <= components.len()
                && prefix
                    .iter()
                    .zip(components)
                    .all(|(p, c)| p.as_str() == c.as_ref())
        })
    }

    /// Check if a raw path string falls under any managed prefix
    pub fn manages_path(&self, path: &str) -> bool {
        split_path(path).map_or(false, |c| self.manages(&c))
    }

    /// Prefixes as absolute path strings
    pub fn to_strings(&self) -> Vec<String> {
        self.prefixes.iter().map(|p| join_components(p)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}
