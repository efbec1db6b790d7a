//! Depth-first traversal built from `list` and `stat`.

use crate::driver::{FileInfo, StorageDriver};
use crate::error::StorageError;

/// What the walk should do after visiting an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep walking, descending into the entry if it is a directory.
    Continue,

    /// Do not descend into this directory. Ignored for files.
    SkipDir,
}

/// Visitor called once per entry found by a walk.
pub type WalkFn<'v> = dyn FnMut(&FileInfo) -> Result<WalkControl, StorageError> + Send + 'v;

/// Walk the tree below `from` in lexical depth-first order, using only
/// `list` and `stat` on the driver.
///
/// The root itself is not visited. Entries which disappear between listing
/// and stat are skipped. A missing root is reported as not found.
pub async fn walk_fallback<D>(
    driver: &D,
    from: &str,
    visitor: &mut WalkFn<'_>,
) -> Result<(), StorageError>
where
    D: StorageDriver + ?Sized,
{
    let mut stack = vec![sorted_children(driver, from).await?.into_iter()];

    while let Some(children) = stack.last_mut() {
        let Some(child) = children.next() else {
            stack.pop();
            continue;
        };

        let info = match driver.stat(&child).await {
            Ok(info) => info,
            Err(error) if error.is_not_found() => continue,
            Err(error) => return Err(error),
        };

        let control = visitor(&info)?;
        if info.is_dir && control == WalkControl::Continue {
            match sorted_children(driver, &child).await {
                Ok(grandchildren) => stack.push(grandchildren.into_iter()),
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error),
            }
        }
    }

    Ok(())
}

async fn sorted_children<D>(driver: &D, path: &str) -> Result<Vec<String>, StorageError>
where
    D: StorageDriver + ?Sized,
{
    let mut children = driver.list(path).await?;
    children.sort();
    Ok(children)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::driver::{FileReader, FileWriter};
    use crate::error::StorageErrorKind;

    /// A tree of paths, where `None` marks a directory.
    #[derive(Debug, Default)]
    struct Tree(BTreeMap<String, Option<u64>>);

    impl Tree {
        fn new(entries: &[(&str, Option<u64>)]) -> Self {
            Tree(
                entries
                    .iter()
                    .map(|(p, s)| (p.to_string(), *s))
                    .collect(),
            )
        }

        fn missing(path: &str) -> StorageError {
            StorageError::builder("tree", StorageErrorKind::NotFound, "missing")
                .path(path)
                .build()
        }
    }

    #[async_trait::async_trait]
    impl StorageDriver for Tree {
        fn name(&self) -> &'static str {
            "tree"
        }

        async fn get_content(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            Err(Tree::missing(path))
        }

        async fn put_content(&self, _path: &str, _content: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }

        async fn reader(&self, path: &str, _offset: u64) -> Result<Box<dyn FileReader>, StorageError> {
            Err(Tree::missing(path))
        }

        async fn writer(&self, path: &str, _append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
            Err(Tree::missing(path))
        }

        async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
            match self.0.get(path) {
                Some(Some(size)) => Ok(FileInfo::file(path, *size, Utc::now())),
                Some(None) => Ok(FileInfo::directory(path, Utc::now())),
                None => Err(Tree::missing(path)),
            }
        }

        async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
            if path != "/" && !matches!(self.0.get(path), Some(None)) {
                return Err(Tree::missing(path));
            }
            let prefix = if path == "/" {
                "/".to_owned()
            } else {
                format!("{path}/")
            };
            Ok(self
                .0
                .keys()
                .filter(|k| {
                    k.strip_prefix(&prefix)
                        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
                })
                .rev()
                .cloned()
                .collect())
        }

        async fn move_to(&self, _source: &str, _dest: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn delete(&self, _path: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn health(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn tree() -> Tree {
        Tree::new(&[
            ("/a", None),
            ("/a/b", None),
            ("/a/b/c.bin", Some(3)),
            ("/a/d", Some(1)),
            ("/e", None),
            ("/e/f", Some(2)),
        ])
    }

    #[tokio::test]
    async fn visits_depth_first_in_order() {
        let tree = tree();
        let mut seen = Vec::new();
        walk_fallback(&tree, "/", &mut |info: &FileInfo| {
            seen.push(info.path.clone());
            Ok(WalkControl::Continue)
        })
        .await
        .unwrap();

        assert_eq!(seen, vec!["/a", "/a/b", "/a/b/c.bin", "/a/d", "/e", "/e/f"]);
    }

    #[tokio::test]
    async fn skip_dir_prunes_subtree() {
        let tree = tree();
        let mut seen = Vec::new();
        walk_fallback(&tree, "/", &mut |info: &FileInfo| {
            seen.push(info.path.clone());
            if info.path == "/a/b" {
                Ok(WalkControl::SkipDir)
            } else {
                Ok(WalkControl::Continue)
            }
        })
        .await
        .unwrap();

        assert_eq!(seen, vec!["/a", "/a/b", "/a/d", "/e", "/e/f"]);
    }

    #[tokio::test]
    async fn visitor_error_stops_walk() {
        let tree = tree();
        let mut count = 0;
        let err = walk_fallback(&tree, "/", &mut |_info: &FileInfo| {
            count += 1;
            Err(StorageError::precondition("test", "stop"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), StorageErrorKind::Precondition);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let tree = tree();
        let err = walk_fallback(&tree, "/nope", &mut |_info: &FileInfo| Ok(WalkControl::Continue))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
