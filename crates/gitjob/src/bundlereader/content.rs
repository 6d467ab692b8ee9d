//! Directory walk producing bundle content.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use tracing::debug;
use walkdir::WalkDir;

use super::ignore::{IgnoreRuleSet, IGNORE_FILE};
use crate::error::{GitJobError, Result};

/// Loads every file below `current_dir` into a map keyed by `prefix` joined
/// with the path relative to `root`.
///
/// `.fleetignore` files in `root`, in the directories between `root` and
/// `current_dir`, and in every walked directory exclude matching base names
/// from their directory downwards. Ignored directories are not descended into.
pub fn load_content(
    root: &Path,
    current_dir: &Path,
    prefix: &str,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let inherited = inherited_rules(root, current_dir)?;
    // (depth of the owning directory, rules)
    let mut scoped: Vec<(usize, IgnoreRuleSet)> = Vec::new();
    let mut files = BTreeMap::new();

    let mut walker = WalkDir::new(current_dir).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| GitJobError::ReadDirectory {
            path: e.path().unwrap_or(current_dir).to_path_buf(),
            source: e.into(),
        })?;
        let depth = entry.depth();
        let is_dir = entry.file_type().is_dir();

        if depth > 0 {
            scoped.retain(|(owner, _)| *owner < depth);

            let name = entry.file_name().to_string_lossy();
            let ignored = name == ".git"
                || inherited
                    .iter()
                    .chain(scoped.iter().map(|(_, rules)| rules))
                    .any(|rules| rules.is_ignored(&name));

            if ignored {
                debug!(path = %entry.path().display(), "Ignoring entry");
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
        }

        if is_dir {
            if let Some(rules) = IgnoreRuleSet::load(entry.path())? {
                scoped.push((depth, rules));
            }
            continue;
        }

        if entry.file_name() == IGNORE_FILE {
            continue;
        }

        let data = std::fs::read(entry.path()).map_err(|e| GitJobError::ReadFile {
            path: entry.path().to_path_buf(),
            source: e,
        })?;
        files.insert(content_key(prefix, root, entry.path()), data);
    }

    debug!(
        dir = %current_dir.display(),
        files = files.len(),
        "Loaded bundle content"
    );
    Ok(files)
}

/// Rules from `root` down to, but not including, `current_dir`.
fn inherited_rules(root: &Path, current_dir: &Path) -> Result<Vec<IgnoreRuleSet>> {
    let Ok(relative) = current_dir.strip_prefix(root) else {
        return Ok(Vec::new());
    };

    let mut rules = Vec::new();
    let mut dir = root.to_path_buf();
    for component in relative.components() {
        if let Some(set) = IgnoreRuleSet::load(&dir)? {
            rules.push(set);
        }
        dir.push(component);
    }
    Ok(rules)
}

fn content_key(prefix: &str, root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut parts: Vec<String> = Vec::new();
    let prefix = prefix.trim_end_matches('/');
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    parts.extend(relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }));
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree(entries: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, contents) in entries {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, contents).unwrap();
        }
        dir
    }

    fn load(dir: &TempDir) -> BTreeMap<String, Vec<u8>> {
        load_content(dir.path(), dir.path(), "").unwrap()
    }

    fn keys(files: &BTreeMap<String, Vec<u8>>) -> Vec<&str> {
        files.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_no_ignore_file() {
        let dir = tree(&[("something.yaml", "foo")]);
        let files = load(&dir);
        assert_eq!(keys(&files), vec!["something.yaml"]);
        assert_eq!(files["something.yaml"], b"foo");
    }

    #[test]
    fn test_empty_ignore_file_is_not_content() {
        let dir = tree(&[("something.yaml", "foo"), (".fleetignore", "")]);
        assert_eq!(keys(&load(&dir)), vec!["something.yaml"]);
    }

    #[test]
    fn test_comment_and_escaped_hash() {
        let dir = tree(&[
            ("something.yaml", "foo"),
            ("#something_else.yaml", "bar"),
            (".fleetignore", "#something.yaml\n\\#something_else.yaml\n"),
        ]);
        assert_eq!(keys(&load(&dir)), vec!["something.yaml"]);
    }

    #[test]
    fn test_glob_rule() {
        let dir = tree(&[
            ("something.yaml", "foo"),
            ("something_else.yaml", "bar"),
            ("keep.yaml", "baz"),
            (".fleetignore", "something*\n"),
        ]);
        assert_eq!(keys(&load(&dir)), vec!["keep.yaml"]);
    }

    #[test]
    fn test_trailing_spaces() {
        let dir = tree(&[
            ("something.yaml", "foo"),
            ("something_else.yaml  ", "bar"),
            ("keep.yaml", "baz"),
            (".fleetignore", "something_else.yaml\\ \\ \nsomething.yaml \n"),
        ]);
        assert_eq!(keys(&load(&dir)), vec!["keep.yaml"]);
    }

    #[test]
    fn test_ignored_directory_is_pruned() {
        let dir = tree(&[
            ("something.yaml", "foo"),
            ("subdir/in_dir.yaml", "bar"),
            ("subdir/deeper/also.yaml", "baz"),
            (".fleetignore", "subdir"),
        ]);
        assert_eq!(keys(&load(&dir)), vec!["something.yaml"]);
    }

    #[test]
    fn test_rule_applies_multiple_levels_down() {
        let dir = tree(&[
            ("something.yaml", "foo"),
            ("subdir/subsubdir/in_dir.yaml", "bar"),
            (".fleetignore", "in_dir.yaml"),
        ]);
        assert_eq!(keys(&load(&dir)), vec!["something.yaml"]);
    }

    #[test]
    fn test_sibling_rules_do_not_interfere() {
        let dir = tree(&[
            ("something.yaml", "foo"),
            ("subdir1/in_dir.yaml", "from dir 1"),
            ("subdir1/.fleetignore", "in_dir.yaml"),
            ("subdir2/in_dir.yaml", "from dir 2"),
        ]);
        let files = load(&dir);
        assert_eq!(keys(&files), vec!["something.yaml", "subdir2/in_dir.yaml"]);
        assert_eq!(files["subdir2/in_dir.yaml"], b"from dir 2");
    }

    #[test]
    fn test_current_dir_inherits_root_rules_and_prefix() {
        let dir = tree(&[
            (".fleetignore", "secret.yaml"),
            ("app/.fleetignore", "local.yaml"),
            ("app/chart/values.yaml", "v"),
            ("app/chart/secret.yaml", "s"),
            ("app/chart/local.yaml", "l"),
        ]);
        let current = dir.path().join("app/chart");
        let files = load_content(dir.path(), &current, "bundle/").unwrap();
        assert_eq!(keys(&files), vec!["bundle/app/chart/values.yaml"]);
    }

    #[test]
    fn test_git_directory_is_skipped() {
        let dir = tree(&[(".git/HEAD", "ref"), ("a.yaml", "a")]);
        assert_eq!(keys(&load(&dir)), vec!["a.yaml"]);
    }

    #[test]
    fn test_invalid_rule_aborts_load() {
        let dir = tree(&[("a.yaml", "a"), ("sub/.fleetignore", "[oops")]);
        let err = load_content(dir.path(), dir.path(), "").unwrap_err();
        assert!(matches!(err, GitJobError::InvalidPattern { .. }));
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = load_content(dir.path(), &missing, "").unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Io);
    }
}
