//! Host checks for the `doctor` command.
//!
//! Resolution only looks at `tool_dirs` and `PATH`; executables that become
//! available through conda activation are reported as missing here.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::pipeline::catalog::all_executables;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCheck {
    pub name: &'static str,
    pub path: Option<PathBuf>,
}

impl ToolCheck {
    pub fn found(&self) -> bool {
        self.path.is_some()
    }
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file()
        && fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

/// First executable named `program` in `dirs`, then `PATH`.
pub fn resolve_executable(program: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    dirs.iter()
        .chain(path_dirs.iter())
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable_file(candidate))
}

/// One entry per executable any stage can invoke.
pub fn check_tools(tool_dirs: &[PathBuf]) -> Vec<ToolCheck> {
    all_executables()
        .into_iter()
        .map(|name| ToolCheck {
            name,
            path: resolve_executable(name, tool_dirs),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_dirs_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let flye = dir.path().join("flye");
        fs::write(&flye, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&flye, fs::Permissions::from_mode(0o755)).unwrap();

        let checks = check_tools(&[dir.path().to_path_buf()]);
        let flye_check = checks.iter().find(|c| c.name == "flye").unwrap();
        assert_eq!(flye_check.path.as_deref(), Some(flye.as_path()));
        assert!(flye_check.found());
        assert!(checks.iter().any(|c| c.name == "blastn"));
    }

    #[test]
    fn test_non_executable_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let racon = dir.path().join("genepipe-not-a-tool");
        fs::write(&racon, "data").unwrap();
        fs::set_permissions(&racon, fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(
            resolve_executable("genepipe-not-a-tool", &[dir.path().to_path_buf()]),
            None
        );
    }
}
