//! Renders an `ExecutionPlan` into one bash script.
//!
//! The script is fail-fast: the first stage that exits non-zero (or leaves
//! its declared artifact missing) writes the abort marker and ends the script
//! with that code. In the cancellable variant every tool runs in its own
//! process group while the script polls for the cancel marker; on a hit the
//! group gets SIGTERM, then SIGKILL after the grace period, the abort marker
//! is written and the script exits 0.
//!
//! Tool arguments are emitted as individually quoted words and executed via
//! `"$@"`. Nothing is ever re-parsed by the shell.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::plan::{ExecutionPlan, Preflight};
use crate::errors::MaterializeError;
use crate::run::layout::{Marker, RunLayout};

/// Knobs that shape the preamble and the command blocks.
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Conda environment to activate; `None` skips activation entirely.
    pub conda_env: Option<String>,
    /// Prepended to `PATH` after conda activation.
    pub tool_dirs: Vec<PathBuf>,
    pub cancel_poll: Duration,
    pub kill_grace: Duration,
    pub cancellable: bool,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            conda_env: Some("pipeline".to_string()),
            tool_dirs: Vec::new(),
            cancel_poll: Duration::from_secs(1),
            kill_grace: Duration::from_secs(2),
            cancellable: true,
        }
    }
}

/// A fully written, executable script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHandle {
    pub path: PathBuf,
}

/// Quote one word for bash. Plain words pass through unchanged.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Whole seconds, at least one (bash `sleep` and the grace loop count seconds).
fn secs(d: Duration) -> u64 {
    d.as_secs().max(1)
}

const HELPERS: &str = r#"log() {
    printf '[%s %s] %s\n' "$LABEL" "$(date '+%H:%M:%S')" "$*"
}

abort_run() {
    local code="$1"
    shift
    log "$LABEL ABORTED (exit code $code): $*"
    touch "$ABORT_MARKER"
    exit "$code"
}

cancel_run() {
    log "$LABEL ABORTED BY USER"
    touch "$ABORT_MARKER"
    exit 0
}

check_cancel() {
    if [ -e "$CANCEL_MARKER" ]; then
        cancel_run
    fi
}

require_artifact() {
    if [ -d "$1" ]; then
        if [ -z "$(ls -A "$1" 2>/dev/null)" ]; then
            abort_run 1 "expected output missing: $1 is empty"
        fi
    elif [ ! -e "$1" ]; then
        abort_run 1 "expected output missing: $1"
    fi
}
"#;

const RUN_TOOL_CANCELLABLE: &str = r#"stop_tool() {
    local pid="$1"
    local waited=0
    log "Stopping PID $pid"
    kill -TERM -- "-$pid" 2>/dev/null || kill -TERM "$pid" 2>/dev/null || true
    while kill -0 "$pid" 2>/dev/null && [ "$waited" -lt "$GRACE_SECS" ]; do
        sleep 1
        waited=$((waited + 1))
    done
    kill -KILL -- "-$pid" 2>/dev/null || kill -KILL "$pid" 2>/dev/null || true
    wait "$pid" 2>/dev/null || true
}

# run_tool <stdout file or -> <program> [args...]
run_tool() {
    local out="$1"
    shift
    log "RUNNING: $(printf '%q ' "$@")"
    if [ "$out" = "-" ]; then
        "$@" &
    else
        "$@" > "$out" &
    fi
    local pid=$!
    while kill -0 "$pid" 2>/dev/null; do
        if [ -e "$CANCEL_MARKER" ]; then
            stop_tool "$pid"
            cancel_run
        fi
        sleep "$POLL_SECS"
    done
    local code=0
    wait "$pid" || code=$?
    if [ "$code" -ne 0 ]; then
        abort_run "$code" "$1"
    fi
}
"#;

const RUN_TOOL_PLAIN: &str = r#"# run_tool <stdout file or -> <program> [args...]
run_tool() {
    local out="$1"
    shift
    log "RUNNING: $(printf '%q ' "$@")"
    local code=0
    if [ "$out" = "-" ]; then
        "$@" || code=$?
    else
        "$@" > "$out" || code=$?
    fi
    if [ "$code" -ne 0 ]; then
        abort_run "$code" "$1"
    fi
}
"#;

fn conda_block(env: &str) -> String {
    let env = shell_quote(env);
    format!(
        r#"for conda_bin in "${{HOME:-}}/miniconda3/bin" "${{HOME:-}}/anaconda3/bin"; do
    if [ -d "$conda_bin" ]; then
        PATH="$conda_bin:$PATH"
    fi
done
export PATH
if command -v conda >/dev/null 2>&1; then
    set +u
    CONDA_BASE="$(conda info --base 2>/dev/null || true)"
    if [ -n "$CONDA_BASE" ] && [ -f "$CONDA_BASE/etc/profile.d/conda.sh" ]; then
        source "$CONDA_BASE/etc/profile.d/conda.sh"
    fi
    conda activate {env} 2>/dev/null || log "Conda env not found: {env}"
    set -u
else
    log "Conda not found; using tools from PATH"
fi
"#
    )
}

/// Render the script text for `plan`.
pub fn render(plan: &ExecutionPlan, layout: &RunLayout, opts: &ScriptOptions) -> String {
    let mut s = String::new();
    let total = plan.stages.len();

    s.push_str("#!/usr/bin/env bash\n");
    let _ = writeln!(
        s,
        "# genepipe {} run in {}",
        plan.run_type,
        layout.run_dir().display()
    );
    s.push_str("set -uo pipefail\n");
    if opts.cancellable {
        // Background tools get their own process group so a cancel can
        // signal the whole tool tree at once.
        s.push_str("set -m\n");
    }
    s.push('\n');

    let _ = writeln!(s, "RUN_DIR={}", quote_path(layout.run_dir()));
    let _ = writeln!(s, "LOG_FILE={}", quote_path(&layout.script_log_path()));
    let _ = writeln!(s, "DONE_MARKER={}", quote_path(&layout.marker_path(Marker::Done)));
    let _ = writeln!(
        s,
        "ABORT_MARKER={}",
        quote_path(&layout.marker_path(Marker::Aborted))
    );
    let _ = writeln!(
        s,
        "CANCEL_MARKER={}",
        quote_path(&layout.marker_path(Marker::Cancel))
    );
    let _ = writeln!(s, "LABEL={}", layout.label());
    let _ = writeln!(s, "POLL_SECS={}", secs(opts.cancel_poll));
    let _ = writeln!(s, "GRACE_SECS={}", secs(opts.kill_grace));
    s.push('\n');

    s.push_str("cd \"$RUN_DIR\" || exit 1\n");
    s.push_str("exec > >(tee -a \"$LOG_FILE\") 2>&1\n");
    // Let tee drain before the script's exit becomes visible.
    s.push_str("TEE_PID=$!\n");
    s.push_str("trap 'exec >&- 2>&-; wait \"$TEE_PID\" 2>/dev/null || true' EXIT\n\n");

    s.push_str(HELPERS);
    s.push('\n');
    s.push_str(if opts.cancellable {
        RUN_TOOL_CANCELLABLE
    } else {
        RUN_TOOL_PLAIN
    });
    s.push('\n');

    if let Some(env) = opts.conda_env.as_deref().filter(|e| !e.is_empty()) {
        s.push_str(&conda_block(env));
    }
    if !opts.tool_dirs.is_empty() {
        let dirs: Vec<String> = opts.tool_dirs.iter().map(|d| quote_path(d)).collect();
        let _ = writeln!(s, "export PATH={}:\"$PATH\"", dirs.join(":"));
    }
    s.push_str("\nlog \"$LABEL STARTED in $RUN_DIR\"\n");
    s.push_str("check_cancel\n");

    for check in &plan.preflight {
        match check {
            Preflight::AnyExists {
                candidates,
                message,
            } => {
                let tests: Vec<String> = candidates
                    .iter()
                    .map(|c| format!("[ -e {} ]", quote_path(c)))
                    .collect();
                let _ = writeln!(s, "if ! {{ {}; }}; then", tests.join(" || "));
                let _ = writeln!(s, "    log {}", shell_quote(&format!("ERROR: {}", message)));
                let _ = writeln!(s, "    abort_run 1 {}", shell_quote(message));
                s.push_str("fi\n");
            }
        }
    }

    for (i, stage) in plan.stages.iter().enumerate() {
        let _ = writeln!(s, "\n# stage {}/{}: {}", i + 1, total, stage.id);
        s.push_str("check_cancel\n");
        let _ = writeln!(s, "log \"STEP {}/{}: {}\"", i + 1, total, stage.id);
        if !stage.subdirs.is_empty() {
            let dirs: Vec<String> = stage.subdirs.iter().map(|d| quote_path(d)).collect();
            let _ = writeln!(
                s,
                "mkdir -p {} || abort_run $? \"cannot create stage directories\"",
                dirs.join(" ")
            );
        }
        for cmd in &stage.commands {
            let out = cmd
                .stdout
                .as_deref()
                .map(quote_path)
                .unwrap_or_else(|| "-".to_string());
            let words: Vec<String> = cmd.argv().into_iter().map(shell_quote).collect();
            let _ = writeln!(s, "run_tool {} {}", out, words.join(" "));
        }
        let _ = writeln!(s, "require_artifact {}", quote_path(&stage.artifact));
    }

    s.push_str("\ntouch \"$DONE_MARKER\"\n");
    s.push_str("log \"$LABEL FINISHED SUCCESSFULLY\"\n");
    s.push_str("exit 0\n");
    s
}

/// Render and write the script for `plan` into the run directory.
///
/// The text goes to a temporary sibling first and is renamed into place only
/// once it is complete and executable.
pub fn materialize(
    plan: &ExecutionPlan,
    layout: &RunLayout,
    opts: &ScriptOptions,
) -> Result<ScriptHandle, MaterializeError> {
    let dir = layout.run_dir();
    fs::create_dir_all(dir).map_err(|source| MaterializeError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = layout.new_script_path();
    let partial = path.with_extension("sh.partial");
    let content = render(plan, layout, opts);

    let result = write_executable(&partial, &path, content.as_bytes());
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result?;

    tracing::debug!(script = %path.display(), stages = plan.stages.len(), "Materialized script");
    Ok(ScriptHandle { path })
}

fn write_executable(partial: &Path, path: &Path, bytes: &[u8]) -> Result<(), MaterializeError> {
    let write_err = |source| MaterializeError::Write {
        path: partial.to_path_buf(),
        source,
    };
    let mut file = fs::File::create(partial).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::set_permissions(partial, fs::Permissions::from_mode(0o755)).map_err(|source| {
        MaterializeError::Permissions {
            path: partial.to_path_buf(),
            source,
        }
    })?;
    fs::rename(partial, path).map_err(|source| MaterializeError::Persist {
        path: path.to_path_buf(),
        source,
    })
}
