use std::path::{Path, PathBuf};

/// Per-project data directory holding `config.toml` and run logs.
pub const DATA_DIR: &str = ".autotune";
const LOGS_DIR: &str = "logs";

pub fn data_dir(root: &Path) -> PathBuf {
    root.join(DATA_DIR)
}

/// Project root for a loaded config file: the directory containing
/// `.autotune/`.
pub fn project_root_for(config_path: &Path) -> Option<PathBuf> {
    let data_dir = config_path.parent()?;
    if data_dir.file_name()? != DATA_DIR {
        return None;
    }
    data_dir.parent().map(Path::to_path_buf)
}

/// Resolve where run logs live.
///
/// A configured directory wins; relative ones are taken from `root`. Without
/// one, logs go to `.autotune/logs/`.
pub fn resolve_log_dir(root: &Path, configured: Option<&Path>) -> PathBuf {
    match configured {
        Some(dir) => root.join(dir),
        None => data_dir(root).join(LOGS_DIR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_dir_is_under_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let result = resolve_log_dir(tmp.path(), None);
        assert_eq!(result, tmp.path().join(".autotune").join("logs"));
    }

    #[test]
    fn relative_log_dir_is_taken_from_root() {
        let tmp = tempfile::tempdir().unwrap();
        let result = resolve_log_dir(tmp.path(), Some(Path::new("results")));
        assert_eq!(result, tmp.path().join("results"));
    }

    #[test]
    fn absolute_log_dir_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let result = resolve_log_dir(tmp.path(), Some(elsewhere.path()));
        assert_eq!(result, elsewhere.path());
    }

    #[test]
    fn project_root_is_parent_of_data_dir() {
        let root = Path::new("/srv/bench");
        let config = root.join(".autotune").join("config.toml");
        assert_eq!(project_root_for(&config), Some(root.to_path_buf()));
        assert_eq!(project_root_for(Path::new("/etc/config.toml")), None);
    }
}
