use rand::{distributions::Alphanumeric, Rng};
use std::path::{Path, PathBuf};

pub fn expand_home_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    let home = || std::env::var("HOME").ok().map(PathBuf::from);
    match raw {
        "~" => home().unwrap_or_else(|| path.to_path_buf()),
        _ => match (raw.strip_prefix("~/"), home()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => path.to_path_buf(),
        },
    }
}

/// Resolves a step's local path against the job directory unless already absolute.
pub fn resolve_local(base: &Path, raw: &str) -> PathBuf {
    let expanded = expand_home_path(raw.trim());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// A hidden sibling for write-then-rename downloads.
pub fn temp_sibling_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("download");
    parent.join(format!(".{}.{}.part", file_name, random_token()))
}

/// Remote path a workspace script is copied to before it runs.
pub fn staged_script_path(local: &Path) -> String {
    let file_name = local
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("script");
    format!("/tmp/.sshsteps-{}-{}", random_token(), file_name)
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_local_joins_relative_paths() {
        let base = Path::new("/work/job-7");
        assert_eq!(
            resolve_local(base, "dist/app.tar.gz"),
            PathBuf::from("/work/job-7/dist/app.tar.gz")
        );
        assert_eq!(resolve_local(base, "/tmp/x"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn staged_scripts_land_in_tmp_under_their_name() {
        let staged = staged_script_path(Path::new("/work/job-7/build.sh"));
        assert!(staged.starts_with("/tmp/.sshsteps-"));
        assert!(staged.ends_with("-build.sh"));
        assert_ne!(staged, staged_script_path(Path::new("/work/job-7/build.sh")));
    }

    #[test]
    fn temp_sibling_stays_in_parent() {
        let tmp = temp_sibling_path("/data/out/report.txt");
        assert_eq!(tmp.parent(), Some(Path::new("/data/out")));
        let name = tmp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".report.txt."));
        assert!(name.ends_with(".part"));
    }
}
