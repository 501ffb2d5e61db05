use std::path::Path;

/// Removes `start` and its ancestors while they are empty, stopping at `root`
/// (never removed). Returns how many directories went away.
pub fn remove_empty_parents(start: &Path, root: &Path) -> usize {
    let mut removed = 0;
    let mut current = start;

    while current.starts_with(root) && current != root {
        let is_empty = match std::fs::read_dir(current) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => false,
        };
        if !is_empty {
            break;
        }

        if let Err(e) = std::fs::remove_dir(current) {
            log::debug!("Could not remove empty directory {}: {}", current.display(), e);
            break;
        }
        log::debug!("Removed empty directory {}", current.display());
        removed += 1;

        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_removes_nested_empty_directories() {
        let root = TempDir::new().unwrap();
        let deep = root.path().join("Show/Season 01/extras");
        std::fs::create_dir_all(&deep).unwrap();

        assert_eq!(remove_empty_parents(&deep, root.path()), 3);
        assert!(!root.path().join("Show").exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_stops_at_non_empty_directory() {
        let root = TempDir::new().unwrap();
        let season = root.path().join("Show/Season 01");
        std::fs::create_dir_all(&season).unwrap();
        std::fs::write(root.path().join("Show/poster.jpg"), "x").unwrap();

        assert_eq!(remove_empty_parents(&season, root.path()), 1);
        assert!(root.path().join("Show").exists());
    }

    #[test]
    fn test_never_leaves_root() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();

        assert_eq!(remove_empty_parents(outside.path(), root.path()), 0);
        assert_eq!(remove_empty_parents(root.path(), root.path()), 0);
        assert!(outside.path().exists());
    }
}
