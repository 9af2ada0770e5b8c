//! Process discovery and signalling.
//!
//! Discovery walks `/proc` through `procfs`; on hosts without it only the
//! root pid and its process group are reachable. Signals go through `nix`.

use std::collections::{HashMap, HashSet};
use std::io;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use procfs::process::Process;

/// `(pid, ppid)` for every readable process.
fn parent_links() -> Vec<(i32, i32)> {
    let Ok(all) = procfs::process::all_processes() else {
        return Vec::new();
    };
    all.filter_map(|p| p.ok())
        .filter_map(|p| p.stat().ok())
        .map(|stat| (stat.pid, stat.ppid))
        .collect()
}

/// Every descendant of `root` (not including `root`), parents before
/// children.
pub fn descendants(root: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for (pid, ppid) in parent_links() {
        children.entry(ppid).or_default().push(pid);
    }

    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    queue.push(kid);
                }
            }
        }
    }
    found
}

/// Outermost processes with a command-line argument accepted by `matches`.
///
/// Forked subshells inherit their parent's command line, so a match whose
/// parent also matches is dropped.
pub fn find_by_arg(matches: impl Fn(&str) -> bool) -> Vec<i32> {
    let Ok(all) = procfs::process::all_processes() else {
        return Vec::new();
    };
    let hits: Vec<(i32, i32)> = all
        .filter_map(|p| p.ok())
        .filter(|p| p.cmdline().is_ok_and(|args| args.iter().any(|a| matches(a))))
        .filter_map(|p| p.stat().ok())
        .map(|stat| (stat.pid, stat.ppid))
        .collect();
    let pids: HashSet<i32> = hits.iter().map(|(pid, _)| *pid).collect();
    hits.into_iter()
        .filter(|(_, ppid)| !pids.contains(ppid))
        .map(|(pid, _)| pid)
        .collect()
}

/// `None` when the command line cannot be read.
pub fn has_arg(pid: i32, matches: impl Fn(&str) -> bool) -> Option<bool> {
    let args = Process::new(pid).ok()?.cmdline().ok()?;
    Some(args.iter().any(|a| matches(a)))
}

/// Exists and is not a zombie.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let exists = match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    };
    let zombie = Process::new(pid)
        .and_then(|p| p.stat())
        .is_ok_and(|stat| stat.state == 'Z');
    exists && !zombie
}

/// Send `sig` to one process. A process that is already gone is not an
/// error.
pub fn signal(pid: i32, sig: Signal) -> io::Result<()> {
    if pid <= 0 {
        return Ok(());
    }
    ignore_missing(signal::kill(Pid::from_raw(pid), sig))
}

/// Send `sig` to the process group led by `pgid`.
pub fn signal_group(pgid: i32, sig: Signal) -> io::Result<()> {
    if pgid <= 0 {
        return Ok(());
    }
    ignore_missing(signal::killpg(Pid::from_raw(pgid), sig))
}

fn ignore_missing(result: nix::Result<()>) -> io::Result<()> {
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}
