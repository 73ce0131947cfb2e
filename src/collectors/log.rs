use crate::collectors::{CollectError, Collector};
use crate::snapshot::{now_unix, LogEntry, Payload};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

const DEFAULT_MAX_LINES: usize = 100;

pub struct LogTailer {
    paths: Vec<String>,
    max_lines: usize,
}

impl LogTailer {
    pub fn new(paths: Vec<String>, max_lines: usize) -> Self {
        Self {
            paths,
            max_lines: if max_lines == 0 {
                DEFAULT_MAX_LINES
            } else {
                max_lines
            },
        }
    }

    async fn tail(&self, path: &str) -> std::io::Result<VecDeque<String>> {
        let file = File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut window = VecDeque::with_capacity(self.max_lines + 1);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            // stray non-UTF-8 bytes are replaced, not fatal
            window.push_back(String::from_utf8_lossy(&buf).into_owned());
            if window.len() > self.max_lines {
                window.pop_front();
            }
        }
        Ok(window)
    }
}

#[async_trait]
impl Collector for LogTailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn collect(&mut self) -> Result<Payload, CollectError> {
        let now = now_unix();
        let mut entries = Vec::new();
        for path in &self.paths {
            match self.tail(path).await {
                Ok(lines) => {
                    entries.extend(lines.iter().filter_map(|line| parse_line(path, line, now)));
                }
                Err(err) => warn!(path = %path, error = %err, "skipping unreadable log"),
            }
        }
        Ok(Payload::Logs(entries))
    }
}

pub fn detect_level(line: &str) -> &'static str {
    let upper = line.to_uppercase();
    if upper.contains("ERROR") || upper.contains("FATAL") {
        "ERROR"
    } else if upper.contains("WARN") {
        "WARN"
    } else if upper.contains("DEBUG") {
        "DEBUG"
    } else {
        "INFO"
    }
}

fn parse_line(path: &str, line: &str, timestamp: i64) -> Option<LogEntry> {
    let message = line.trim();
    if message.is_empty() {
        return None;
    }
    let source = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    Some(LogEntry {
        source,
        level: detect_level(message).to_string(),
        message: message.to_string(),
        timestamp,
        tags: HashMap::from([("file".to_string(), path.to_string())]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entries(payload: Payload) -> Vec<LogEntry> {
        match payload {
            Payload::Logs(entries) => entries,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn level_detection_is_case_insensitive() {
        assert_eq!(detect_level("2024 [error] disk full"), "ERROR");
        assert_eq!(detect_level("Fatal: panic"), "ERROR");
        assert_eq!(detect_level("WARNING low memory"), "WARN");
        assert_eq!(detect_level("debug: tick"), "DEBUG");
        assert_eq!(detect_level("started"), "INFO");
    }

    #[tokio::test]
    async fn keeps_only_the_last_lines() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for i in 0..10 {
            writeln!(file, "line {i}").expect("write");
        }
        let path = file.path().to_string_lossy().into_owned();

        let mut tailer = LogTailer::new(vec![path.clone()], 3);
        let got = entries(tailer.collect().await.expect("collect"));

        let messages: Vec<&str> = got.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 7", "line 8", "line 9"]);
        assert_eq!(got[0].tags.get("file"), Some(&path));
        let base = file.path().file_name().unwrap().to_string_lossy();
        assert_eq!(got[0].source, base);
    }

    #[tokio::test]
    async fn blank_lines_are_dropped_and_missing_files_skipped() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "  ERROR boom  \n\n   \nwarn: slow\n").expect("write");
        let path = file.path().to_string_lossy().into_owned();

        let mut tailer = LogTailer::new(
            vec!["/nonexistent/definitely/missing.log".to_string(), path],
            100,
        );
        let got = entries(tailer.collect().await.expect("collect"));

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message, "ERROR boom");
        assert_eq!(got[0].level, "ERROR");
        assert_eq!(got[1].level, "WARN");
    }

    #[tokio::test]
    async fn invalid_utf8_keeps_every_line() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"ERROR first\nbad \xff byte\nWARN last\n")
            .expect("write");
        let path = file.path().to_string_lossy().into_owned();

        let mut tailer = LogTailer::new(vec![path], 100);
        let got = entries(tailer.collect().await.expect("collect"));

        assert_eq!(got.len(), 3);
        assert_eq!(got[0].level, "ERROR");
        assert_eq!(got[1].message, "bad \u{FFFD} byte");
        assert_eq!(got[2].message, "WARN last");
    }

    #[test]
    fn zero_max_lines_falls_back_to_default() {
        assert_eq!(LogTailer::new(vec![], 0).max_lines, DEFAULT_MAX_LINES);
    }
}
