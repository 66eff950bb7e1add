pub mod compare;
pub mod show;

use eyre::{Result, WrapErr};
use memtrace::LeakReport;
use std::fs;
use std::path::Path;

/// Reads a report written by `JsonReporter` or `JsonPrettyReporter`.
///
/// The file may hold other output around the report; the last line that parses
/// as a report wins.
pub fn load_report(path: &Path) -> Result<LeakReport> {
    let raw = fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;

    if let Ok(report) = serde_json::from_str::<LeakReport>(&raw) {
        return Ok(report);
    }

    raw.lines()
        .rev()
        .find_map(|line| serde_json::from_str::<LeakReport>(line).ok())
        .ok_or_else(|| eyre::eyre!("no leak report found in {}", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_report_skips_surrounding_output() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "starting up").unwrap();
        writeln!(
            file,
            r#"{{"level":"bytes","bytes_tracked":8,"count_tracked":1,"size_percentiles":[],"leaks":[{{"size":8,"acquired_ns":5,"stack_id":null}}],"stacks_by_bytes":[],"stacks_by_count":[]}}"#
        )
        .unwrap();
        writeln!(file, "bye").unwrap();

        let report = load_report(file.path()).unwrap();
        assert_eq!(report.bytes_tracked, 8);
        assert_eq!(report.leaks.len(), 1);
    }

    #[test]
    fn test_load_report_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a report").unwrap();
        assert!(load_report(file.path()).is_err());
    }
}
