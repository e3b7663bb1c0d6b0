use std::path::{Path, PathBuf};

/// Joins a base path with an absolute or relative path, treating absolute
/// paths as relative to the base. `join_relative("/mnt", "/etc/hosts")`
/// yields `/mnt/etc/hosts`.
pub fn join_relative(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let relative = path.strip_prefix("/").unwrap_or(path);
    base.as_ref().join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_relative() {
        assert_eq!(
            join_relative("/mnt/newroot", "/etc/hosts"),
            PathBuf::from("/mnt/newroot/etc/hosts")
        );
        assert_eq!(
            join_relative("/mnt/newroot", "etc/hosts"),
            PathBuf::from("/mnt/newroot/etc/hosts")
        );
    }
}
