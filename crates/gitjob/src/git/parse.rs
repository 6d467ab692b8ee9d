//! Git output parsing helpers.

use std::process::Output;

/// Formats a git error with both stdout and stderr for better debugging.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// Finds the commit for `reference` in `git ls-remote` output.
///
/// Each line is `<sha>\t<ref>`. Annotated tags also list a peeled `^{}` entry,
/// which points at the commit and wins over the tag object.
pub fn parse_ls_remote(output: &str, reference: &str) -> Option<String> {
    let peeled = format!("{}^{{}}", reference);
    let mut found = None;

    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(sha), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };

        if name == peeled {
            return Some(sha.to_string());
        }
        if name == reference && found.is_none() {
            found = Some(sha.to_string());
        }
    }

    found
}
