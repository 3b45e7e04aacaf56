//! Capture persistence: filename expansion, transcript cleaning, atomic writes.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Expands `{device_name}`, `{device_id}` and `{timestamp}` in a filename
/// pattern. Unrecognized `{variables}` pass through literally.
pub fn expand_filename(
    pattern: &str,
    device_name: &str,
    device_id: i64,
    at: DateTime<Utc>,
) -> String {
    static VAR: OnceLock<Regex> = OnceLock::new();
    let re = VAR.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("variable pattern"));

    re.replace_all(pattern, |caps: &regex::Captures| match &caps[1] {
        "device_name" => device_name.to_string(),
        "device_id" => device_id.to_string(),
        "timestamp" => at.format("%Y%m%d_%H%M%S").to_string(),
        _ => caps[0].to_string(),
    })
    .into_owned()
}

/// Strips the command echo (everything through the line echoing `command`)
/// and trailing prompt lines from a shell transcript. Returns the input
/// unchanged when the echo cannot be located.
pub fn clean_transcript(raw: &str, command: Option<&str>) -> String {
    static PROMPT_LINE: OnceLock<Regex> = OnceLock::new();
    let prompt_re = PROMPT_LINE
        .get_or_init(|| Regex::new(r"^[\w\-\.]+(\([\w\-\.]+\))?[#>$%]\s*$").expect("prompt pattern"));

    let Some(command) = command.filter(|c| !c.is_empty()) else {
        return raw.to_string();
    };

    let lines: Vec<&str> = raw.lines().collect();
    let needle = command.to_lowercase();
    let Some(echo_idx) = lines.iter().position(|l| l.to_lowercase().contains(&needle)) else {
        return raw.to_string();
    };

    let mut cleaned: Vec<&str> = lines[echo_idx + 1..]
        .iter()
        .filter(|l| !prompt_re.is_match(l.trim()))
        .copied()
        .collect();
    while cleaned.last().map_or(false, |l| l.trim().is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

/// Atomic capture write: the bytes land in a temp file in the destination
/// directory and are renamed into place, so a reader can never observe a
/// truncated capture.
pub fn write_capture(dir: &Path, filename: &str, contents: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    let path = dir.join(filename);
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expands_known_variables() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(
            expand_filename("{device_name}_{timestamp}.txt", "den-sw1", 7, at),
            "den-sw1_20250314_092653.txt"
        );
        assert_eq!(
            expand_filename("{device_id}-config.txt", "den-sw1", 7, at),
            "7-config.txt"
        );
    }

    #[test]
    fn unknown_variables_pass_through() {
        let at = Utc::now();
        assert_eq!(
            expand_filename("{device_name}.{extension}", "sw1", 1, at),
            "sw1.{extension}"
        );
    }

    #[test]
    fn cleans_echo_and_trailing_prompts() {
        let raw = "sw1# show ip arp\r\nProtocol  Address\nInternet  10.0.0.1\nsw1#\n";
        let cleaned = clean_transcript(raw, Some("show ip arp"));
        assert_eq!(cleaned, "Protocol  Address\nInternet  10.0.0.1");
    }

    #[test]
    fn keeps_raw_when_echo_is_missing() {
        let raw = "Protocol  Address\nInternet  10.0.0.1\n";
        assert_eq!(clean_transcript(raw, Some("show version")), raw);
        assert_eq!(clean_transcript(raw, None), raw);
    }

    #[test]
    fn strips_config_mode_prompts() {
        let raw = "sw1# show run\nhostname sw1\nsw1(config)#\nsw1#\n";
        let cleaned = clean_transcript(raw, Some("show run"));
        assert_eq!(cleaned, "hostname sw1");
    }

    #[test]
    fn atomic_write_creates_directories_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("arp");
        let path = write_capture(&target, "sw1.txt", b"contents").unwrap();
        assert_eq!(path, target.join("sw1.txt"));
        assert_eq!(fs::read(&path).unwrap(), b"contents");
        // No stray temp files left behind.
        let entries: Vec<_> = fs::read_dir(&target).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "sw1.txt", b"old").unwrap();
        write_capture(dir.path(), "sw1.txt", b"new").unwrap();
        assert_eq!(fs::read(dir.path().join("sw1.txt")).unwrap(), b"new");
    }
}
