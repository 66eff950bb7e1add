#[cfg(test)]
pub mod tests {
    use std::fs;
    use std::process::Command;

    fn run_example(name: &str, format: &str) -> std::process::Output {
        Command::new("cargo")
            .args(["run", "--example", name])
            .env("MEMTRACE_FORMAT", format)
            .env("NO_COLOR", "1")
            .output()
            .expect("Failed to execute command")
    }

    #[test]
    fn test_basic_log_output() {
        let output = run_example("basic", "log");
        assert!(
            output.status.success(),
            "Process did not exit successfully: {output:?}",
        );

        let expected = [
            "BEGIN MEMTRACE DUMP",
            "bytes still allocated in",
            "Leaks in order of allocation:",
            "Stacks by bytes leaked:",
            "Stacks by number of leaks:",
            "leak_buffer",
            "leak_cache_entries",
            "END MEMTRACE DUMP",
        ];

        let stdout = String::from_utf8_lossy(&output.stdout);
        for expected in expected {
            assert!(
                stdout.contains(expected),
                "Output did not match expected.\nExpected:\n{expected}\n\nGot:\n{stdout}",
            );
        }
        assert!(!stdout.contains("transient_work"));
    }

    #[test]
    fn test_basic_release_keeps_call_sites() {
        let output = Command::new("cargo")
            .args(["run", "--release", "--example", "basic"])
            .env("MEMTRACE_FORMAT", "log")
            .env("NO_COLOR", "1")
            .output()
            .expect("Failed to execute command");
        assert!(
            output.status.success(),
            "Process did not exit successfully: {output:?}",
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        for expected in ["leak_buffer", "leak_cache_entries"] {
            assert!(
                stdout.contains(expected),
                "Output did not match expected.\nExpected:\n{expected}\n\nGot:\n{stdout}",
            );
        }
    }

    #[test]
    fn test_basic_table_output() {
        let output = run_example("basic", "table");
        assert!(
            output.status.success(),
            "Process did not exit successfully: {output:?}",
        );

        let expected = [
            "[memtrace]",
            "Leaks in order of allocation",
            "Stacks by bytes leaked",
            "Allocated at",
            "P50",
        ];

        let stdout = String::from_utf8_lossy(&output.stdout);
        for expected in expected {
            assert!(
                stdout.contains(expected),
                "Output did not match expected.\nExpected:\n{expected}\n\nGot:\n{stdout}",
            );
        }
    }

    #[test]
    fn test_custom_reporter_output() {
        let output = run_example("custom_reporter", "log");
        assert!(
            output.status.success(),
            "Process did not exit successfully: {output:?}",
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            stdout.contains("512 live bytes in 2 allocations"),
            "Unexpected output:\n{stdout}"
        );
        assert!(stdout.contains("512 bytes from 2 allocations:"));
    }

    #[test]
    fn test_periodic_output() {
        let output = run_example("periodic", "log");
        assert!(
            output.status.success(),
            "Process did not exit successfully: {output:?}",
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            stdout.matches("[memtrace] leak report").count() >= 2,
            "Expected repeated dumps:\n{stdout}"
        );
    }

    #[test]
    fn test_show_and_compare_json_reports() {
        let dir = tempfile::tempdir().unwrap();

        let output = run_example("basic", "json");
        assert!(
            output.status.success(),
            "Process did not exit successfully: {output:?}",
        );
        let before = dir.path().join("before.json");
        fs::write(&before, &output.stdout).unwrap();

        let show = Command::new("cargo")
            .args(["run", "--bin", "memtrace", "--", "show"])
            .arg(&before)
            .env("NO_COLOR", "1")
            .output()
            .expect("Failed to execute command");
        assert!(show.status.success(), "show failed: {show:?}");
        let stdout = String::from_utf8_lossy(&show.stdout);
        assert!(stdout.contains("Stacks by number of leaks"), "Got:\n{stdout}");

        let compare = Command::new("cargo")
            .args(["run", "--bin", "memtrace", "--", "compare", "--before"])
            .arg(&before)
            .arg("--after")
            .arg(&before)
            .arg("--fail-on-growth")
            .env("NO_COLOR", "1")
            .output()
            .expect("Failed to execute command");
        assert!(compare.status.success(), "compare failed: {compare:?}");
        let stdout = String::from_utf8_lossy(&compare.stdout);
        assert!(stdout.contains("(+0.0%)"), "Got:\n{stdout}");
    }
}
