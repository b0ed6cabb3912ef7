//! ABS → local path translation.
//!
//! ABS reports audio file paths as it sees them inside its own container
//! (e.g. `/audiobooks/Author/Book/file.m4b`). The bridge mounts the same
//! library elsewhere. Explicit mappings are checked in order, then the
//! default ABS prefix is stripped and the remainder joined onto the media
//! dir.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathMapper {
    /// Ordered `(abs_prefix, local_root)` pairs, checked first.
    mappings: Vec<(String, PathBuf)>,
    /// Default ABS-side prefix.
    abs_prefix: String,
    /// Local root replacing the default prefix.
    media_dir: PathBuf,
}

impl PathMapper {
    pub fn new(
        mappings: Vec<(String, PathBuf)>,
        abs_prefix: impl Into<String>,
        media_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mappings,
            abs_prefix: abs_prefix.into(),
            media_dir: media_dir.into(),
        }
    }

    /// Parses the `SAB_PATH_MAPPINGS` format: `abs_prefix:local_path` pairs
    /// separated by commas.
    pub fn parse_mappings(spec: &str) -> Vec<(String, PathBuf)> {
        spec.split(',')
            .filter_map(|pair| {
                let pair = pair.trim();
                if pair.is_empty() {
                    return None;
                }
                let (prefix, local) = pair.split_once(':')?;
                Some((prefix.trim().to_string(), PathBuf::from(local.trim())))
            })
            .collect()
    }

    /// Translates an ABS path to a local filesystem path.
    pub fn to_local(&self, abs_path: &str) -> PathBuf {
        for (prefix, local) in &self.mappings {
            if let Some(rest) = strip_path_prefix(abs_path, prefix) {
                return join_rest(local, rest);
            }
        }

        if let Some(rest) = strip_path_prefix(abs_path, &self.abs_prefix) {
            return join_rest(&self.media_dir, rest);
        }

        // Unknown prefix: keep the relative shape under the media dir
        join_rest(&self.media_dir, abs_path)
    }
}

/// Prefix strip that only matches on path-component boundaries, so
/// `/audiobooks2/x` does not match prefix `/audiobooks`.
fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn join_rest(root: &Path, rest: &str) -> PathBuf {
    root.join(rest.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        PathMapper::new(
            vec![
                ("/podcasts".to_string(), PathBuf::from("/mnt/pods")),
                ("/audiobooks/kids".to_string(), PathBuf::from("/mnt/kids")),
            ],
            "/audiobooks",
            "/media",
        )
    }

    #[test]
    fn explicit_mapping_wins() {
        assert_eq!(
            mapper().to_local("/podcasts/show/ep1.mp3"),
            PathBuf::from("/mnt/pods/show/ep1.mp3")
        );
    }

    #[test]
    fn mappings_checked_in_order() {
        // /audiobooks/kids is listed before the default prefix applies
        assert_eq!(
            mapper().to_local("/audiobooks/kids/book/a.m4b"),
            PathBuf::from("/mnt/kids/book/a.m4b")
        );
    }

    #[test]
    fn default_prefix_strip() {
        assert_eq!(
            mapper().to_local("/audiobooks/Author/Book/01.m4b"),
            PathBuf::from("/media/Author/Book/01.m4b")
        );
    }

    #[test]
    fn prefix_matches_component_boundary_only() {
        assert_eq!(
            mapper().to_local("/audiobooks2/Book/01.m4b"),
            PathBuf::from("/media/audiobooks2/Book/01.m4b")
        );
    }

    #[test]
    fn parse_mapping_spec() {
        let parsed = PathMapper::parse_mappings("/a:/x, /b:/y");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], ("/a".to_string(), PathBuf::from("/x")));
        assert_eq!(parsed[1], ("/b".to_string(), PathBuf::from("/y")));
    }
}
