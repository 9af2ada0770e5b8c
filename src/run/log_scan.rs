//! Reading run logs and scanning them for completion and failure text.

use std::borrow::Cow;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::LazyLock;

use genepipe_common::RunType;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

static ANSI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B[@-_][0-?]*[ -/]*[@-~]").unwrap());

/// Remove ANSI escape sequences (colours, cursor movement).
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_REGEX.replace_all(text, "")
}

/// Whole log, or `None` if it does not exist yet.
pub async fn read_log(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Last `max_bytes` of the log. When the read starts mid-file the partial
/// first line is dropped.
pub async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<Option<String>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;

    let text = String::from_utf8_lossy(&buf);
    if start > 0
        && let Some(newline) = text.find('\n')
    {
        return Ok(Some(text[newline + 1..].to_string()));
    }
    Ok(Some(text.into_owned()))
}

/// Finds hard-failure indicators in log text.
pub trait FailureDetector: Send + Sync {
    /// The first offending line, if any.
    fn detect(&self, text: &str) -> Option<String>;
}

/// Matches any of a fixed list of substrings, line by line.
#[derive(Debug, Clone)]
pub struct KeywordDetector {
    keywords: Vec<String>,
}

pub const DEFAULT_FAILURE_KEYWORDS: [&str; 7] = [
    "Traceback",
    "Exception",
    "PIPELINE ABORTED",
    "Pipeline aborted",
    "Fatal Error",
    "Error:",
    "Failed:",
];

impl KeywordDetector {
    pub fn new(keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for KeywordDetector {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_KEYWORDS)
    }
}

impl FailureDetector for KeywordDetector {
    fn detect(&self, text: &str) -> Option<String> {
        text.lines()
            .find(|line| self.keywords.iter().any(|k| line.contains(k.as_str())))
            .map(|line| line.trim().to_string())
    }
}

/// Phrases the script prints on its way out.
#[derive(Debug, Clone, Copy)]
pub struct Sentinels {
    pub finished: &'static [&'static str],
    pub cancelled: &'static [&'static str],
}

pub fn sentinels(run_type: RunType) -> Sentinels {
    match run_type {
        RunType::Pipeline => Sentinels {
            finished: &["PIPELINE FINISHED SUCCESSFULLY", "PIPELINE FINISHED"],
            cancelled: &["PIPELINE ABORTED BY USER"],
        },
        RunType::Blast => Sentinels {
            finished: &[
                "BLAST FINISHED SUCCESSFULLY",
                "BLAST pipeline finished successfully",
            ],
            cancelled: &["BLAST ABORTED BY USER"],
        },
    }
}

/// What the log text says about a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSignals {
    pub finished: bool,
    pub cancelled: bool,
    pub failure: Option<String>,
}

/// Scan ANSI-stripped log text.
pub fn scan(text: &str, run_type: RunType, detector: &dyn FailureDetector) -> LogSignals {
    let clean = strip_ansi(text);
    let phrases = sentinels(run_type);
    LogSignals {
        finished: phrases.finished.iter().any(|p| clean.contains(p)),
        cancelled: phrases.cancelled.iter().any(|p| clean.contains(p)),
        failure: detector.detect(&clean),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        let coloured = "\x1b[31mError:\x1b[0m bad \x1b[1;32mthing\x1b[0m";
        assert_eq!(strip_ansi(coloured), "Error: bad thing");
        assert!(matches!(strip_ansi("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn test_keyword_detector_returns_first_hit() {
        let detector = KeywordDetector::default();
        let text = "[PIPELINE 10:00:00] STEP 1/2\nflye: Error: not enough reads\nFailed: again\n";
        assert_eq!(
            detector.detect(text),
            Some("flye: Error: not enough reads".to_string())
        );
        assert_eq!(detector.detect("all good\n"), None);
    }

    #[test]
    fn test_keyword_detector_is_case_sensitive() {
        let detector = KeywordDetector::default();
        assert_eq!(detector.detect("0 errors: none\n"), None);
    }

    #[test]
    fn test_custom_keywords() {
        let detector = KeywordDetector::new(["OOM"]);
        assert!(detector.detect("killed: OOM").is_some());
        assert!(detector.detect("Traceback").is_none());
    }

    #[test]
    fn test_scan_sentinels() {
        let detector = KeywordDetector::default();
        let done = scan(
            "[PIPELINE 10:00:00] PIPELINE FINISHED SUCCESSFULLY\n",
            RunType::Pipeline,
            &detector,
        );
        assert!(done.finished && !done.cancelled);
        assert!(done.failure.is_none());

        let cancelled = scan(
            "[PIPELINE 10:00:00] PIPELINE ABORTED BY USER\n",
            RunType::Pipeline,
            &detector,
        );
        assert!(cancelled.cancelled);
        assert!(cancelled.failure.is_some());

        let blast = scan("BLAST pipeline finished successfully\n", RunType::Blast, &detector);
        assert!(blast.finished);
    }

    #[test]
    fn test_scan_strips_ansi_before_matching() {
        let detector = KeywordDetector::default();
        let text = "\x1b[1mPIPELINE\x1b[0m FINISHED SUCCESSFULLY";
        assert!(scan(text, RunType::Pipeline, &detector).finished);
    }

    #[tokio::test]
    async fn test_read_tail_drops_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        tokio::fs::write(&path, "first line\nsecond line\nthird\n")
            .await
            .unwrap();

        let tail = read_tail(&path, 15).await.unwrap().unwrap();
        assert_eq!(tail, "third\n");
        let all = read_tail(&path, 1024).await.unwrap().unwrap();
        assert!(all.starts_with("first line"));
        assert_eq!(read_tail(&dir.path().join("missing"), 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_log_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_log(&dir.path().join("nope")).await.unwrap(), None);
    }
}
