//! Translation between logical paths and paths under the remote base directory.

use camino::{Utf8Path, Utf8PathBuf};
use storage_driver::{StorageError, StorageErrorKind};

use crate::DRIVER_NAME;

/// Normalize a configured base directory: no trailing slashes, and the
/// remote root becomes the empty string.
pub(crate) fn base(base: &str) -> String {
    base.trim_end_matches('/').to_owned()
}

/// Check that `path` is a logical path the driver will accept.
pub(crate) fn validate(path: &str) -> Result<(), StorageError> {
    let reason = if !path.starts_with('/') {
        "path must be absolute"
    } else if path.contains('\0') {
        "path must not contain NUL bytes"
    } else if path.split('/').any(|segment| segment == "..") {
        "path must not contain '..' segments"
    } else {
        return Ok(());
    };

    Err(StorageError::builder(DRIVER_NAME, StorageErrorKind::InvalidPath, reason)
        .path(path)
        .build())
}

/// The remote location of logical `path`.
pub(crate) fn join(base: &str, path: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{base}{path}"))
}

/// The logical path of remote location `remote`. Locations outside the base
/// directory are returned unchanged.
pub(crate) fn strip(base: &str, remote: &str) -> String {
    if base.is_empty() {
        return remote.to_owned();
    }
    match remote.strip_prefix(base) {
        Some("") => "/".to_owned(),
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        _ => remote.to_owned(),
    }
}

/// The directory which must exist before `remote` can be created.
pub(crate) fn parent(remote: &Utf8Path) -> Option<&Utf8Path> {
    remote
        .parent()
        .filter(|parent| !parent.as_str().is_empty() && parent.as_str() != "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for base_dir in ["", "/", "/srv/registry", "/srv/registry/"] {
            let base_dir = base(base_dir);
            for path in ["/", "/a", "/a/b/c.bin", "/a/b/", "/docker/registry/v2/"] {
                let remote = join(&base_dir, path);
                assert_eq!(strip(&base_dir, remote.as_str()), path, "base {base_dir:?}");
            }
        }
    }

    #[test]
    fn join_prefixes_base() {
        assert_eq!(join(&base("/srv/"), "/a/b"), "/srv/a/b");
        assert_eq!(join(&base("/"), "/a/b"), "/a/b");
    }

    #[test]
    fn strip_only_at_segment_boundary() {
        assert_eq!(strip("/srv", "/srv"), "/");
        assert_eq!(strip("/srv", "/srv/a"), "/a");
        assert_eq!(strip("/srv", "/srvx/a"), "/srvx/a");
    }

    #[test]
    fn validation() {
        assert!(validate("/a/b").is_ok());
        assert!(validate("/a/..b/c").is_ok());

        for bad in ["a/b", "", "/a/../b", "/..", "/a\0b"] {
            let err = validate(bad).unwrap_err();
            assert_eq!(err.kind(), StorageErrorKind::InvalidPath, "{bad:?}");
        }
    }

    #[test]
    fn parents() {
        assert_eq!(parent(Utf8Path::new("/srv/a/b")), Some(Utf8Path::new("/srv/a")));
        assert_eq!(parent(Utf8Path::new("/a")), None);
    }
}
