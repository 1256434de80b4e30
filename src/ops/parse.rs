//! Pure parsers for the frame formats embedded in helper output.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use super::FileEntry;
use crate::protocol::{clean_payload, ERR};

/// Parse listing lines of the form `<decimal-size> <path>`; a trailing `/`
/// on the path marks a directory. Lines that do not split into exactly two
/// fields are skipped.
pub fn parse_listing(payload: &str) -> Vec<FileEntry> {
    let mut files = Vec::new();
    for raw_line in payload.split('\n') {
        let line = raw_line.trim_end_matches('\r').trim_start();
        if line.is_empty() {
            continue;
        }
        let Some((size_field, path)) = line.split_once(' ') else {
            continue;
        };
        let Ok(size) = size_field.parse::<u64>() else {
            tracing::trace!(line, "skipping listing line with non-numeric size");
            continue;
        };
        files.push(FileEntry {
            path: path.to_string(),
            is_dir: path.ends_with('/'),
            size,
            last_modified: None,
            created: None,
        });
    }
    files
}

/// One streamed transfer-progress frame (`verbose` uploads/downloads).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProgressFrame {
    pub written: u64,
    pub total: u64,
    #[serde(rename = "currentFilePos")]
    pub current_file_pos: usize,
    #[serde(rename = "totalFilesCount")]
    pub total_files_count: usize,
}

pub fn parse_progress_frame(text: &str) -> Result<ProgressFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Render a progress frame as the caller-facing label
/// `'<file>' [<pos>/<count>]`.
pub fn format_progress(frame: &ProgressFrame, files: &[String]) -> String {
    let file = frame
        .current_file_pos
        .checked_sub(1)
        .and_then(|idx| files.get(idx))
        .map(String::as_str)
        .unwrap_or("?");
    format!(
        "'{}' [{}/{}]",
        file, frame.current_file_pos, frame.total_files_count
    )
}

#[derive(Debug, Deserialize)]
struct HashFrame {
    file: String,
    hash: String,
}

/// Parse `{"file": …, "hash": …}` lines into a map. Lines carrying the
/// helper error token or the word `error` are skipped.
pub fn parse_hash_lines(payload: &str) -> HashMap<String, String> {
    let mut hashes = HashMap::new();
    for raw_line in payload.split('\n') {
        let line = raw_line.trim_end_matches('\r').trim();
        if line.is_empty() || line.contains("error") || line.contains(ERR) {
            continue;
        }
        match serde_json::from_str::<HashFrame>(line) {
            Ok(frame) => {
                hashes.insert(frame.file, frame.hash);
            }
            Err(err) => {
                tracing::warn!(line, %err, "skipping malformed hash frame");
            }
        }
    }
    hashes
}

/// Stat frame as printed by the device, epoch seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StatFrame {
    pub creation_time: i64,
    pub modification_time: i64,
    pub size: u64,
    pub is_dir: bool,
}

pub fn parse_stat_frame(text: &str) -> Result<StatFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Build a [`FileEntry`] from a stat frame, widening the device's epoch
/// seconds to millisecond timestamps.
pub fn file_entry_from_stat(path: &str, frame: &StatFrame) -> FileEntry {
    FileEntry {
        path: path.to_string(),
        is_dir: frame.is_dir,
        size: frame.size,
        last_modified: millis_timestamp(frame.modification_time),
        created: millis_timestamp(frame.creation_time),
    }
}

fn millis_timestamp(epoch_seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(epoch_seconds.checked_mul(1000)?).single()
}

/// Rename frame: `{"success": bool, "error"?: string}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RenameFrame {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn parse_rename_frame(text: &str) -> Result<RenameFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Split a port-scan response into its non-empty lines.
pub fn parse_ports(payload: &str) -> Vec<String> {
    clean_payload(payload)
        .split('\n')
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EOO;

    #[test]
    fn listing_parses_sizes_and_directories() {
        let files = parse_listing("  42 foo\n   0 bar/\n");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "foo");
        assert_eq!(files[0].size, 42);
        assert!(!files[0].is_dir);
        assert_eq!(files[1].path, "bar/");
        assert_eq!(files[1].size, 0);
        assert!(files[1].is_dir);
    }

    #[test]
    fn listing_skips_malformed_lines() {
        let files = parse_listing("oops\n 12 ok.py\nnot-a-size file\n\n");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "ok.py");
    }

    #[test]
    fn listing_keeps_paths_with_spaces_whole() {
        let files = parse_listing("  7 my file.txt\n");
        assert_eq!(files[0].path, "my file.txt");
    }

    #[test]
    fn progress_frame_round_trips() {
        let frame = parse_progress_frame(
            r#"{"written": 50, "total": 100, "currentFilePos": 1, "totalFilesCount": 2}"#,
        )
        .unwrap();
        assert_eq!(frame.written, 50);
        let files = vec!["/a.py".to_string(), "/b.py".to_string()];
        assert_eq!(format_progress(&frame, &files), "'/a.py' [1/2]");
    }

    #[test]
    fn progress_label_survives_out_of_range_pos() {
        let frame = ProgressFrame {
            written: 1,
            total: 1,
            current_file_pos: 9,
            total_files_count: 2,
        };
        assert_eq!(format_progress(&frame, &[]), "'?' [9/2]");
    }

    #[test]
    fn hash_lines_skip_errors() {
        let payload = format!(
            "{}\n{}\n{}\n",
            r#"{"file": "main.py", "hash": "ab12"}"#,
            r#"{"file": "bad.py", "error": "open failed"}"#,
            ERR,
        );
        let hashes = parse_hash_lines(&payload);
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes["main.py"], "ab12");
    }

    #[test]
    fn stat_frame_widens_to_millis() {
        let frame = parse_stat_frame(
            r#"{"creation_time": 100, "modification_time": 200, "size": 31, "is_dir": false}"#,
        )
        .unwrap();
        let entry = file_entry_from_stat("/main.py", &frame);
        assert_eq!(entry.size, 31);
        assert!(!entry.is_dir);
        assert_eq!(entry.created.unwrap().timestamp_millis(), 100_000);
        assert_eq!(entry.last_modified.unwrap().timestamp_millis(), 200_000);
    }

    #[test]
    fn ports_split_and_trim() {
        let payload = format!("COM3,115200\r\n/dev/ttyACM0,115200\n{EOO}\n");
        assert_eq!(
            parse_ports(&payload),
            vec!["COM3,115200", "/dev/ttyACM0,115200"]
        );
    }
}
