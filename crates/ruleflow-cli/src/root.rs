use ruleflow_core::config::CONFIG_FILE;
use std::path::{Path, PathBuf};

/// Resolve the working root.
///
/// `--root` / `RULEFLOW_ROOT` wins; otherwise the nearest ancestor of the
/// current directory holding a `ruleflow.yaml`, falling back to the current
/// directory itself.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    cwd.ancestors()
        .find(|dir| dir.join(CONFIG_FILE).is_file())
        .map(Path::to_path_buf)
        .unwrap_or(cwd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_root_wins() {
        assert_eq!(
            resolve_root(Some(Path::new("/srv/rules"))),
            PathBuf::from("/srv/rules")
        );
    }
}
