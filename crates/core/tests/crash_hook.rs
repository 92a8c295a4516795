use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use pdfdesk_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "PDFDESK_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "PDFDESK_PANIC_CHILD_DATA_DIR";

/// Re-runs this test binary filtered to the child entrypoint so the panic
/// happens in a separate process.
fn spawn_panicking_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .args(["panic_hook_child_entrypoint", "--exact", "--nocapture"])
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir_of(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir"));

    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::Installed { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "writable" => panic!("conversion worker exploded"),
        "unwritable" => {
            let crash_dir = crash_dir_of(&data_dir);
            fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            fs::write(&crash_dir, b"not-a-directory").expect("replace crash dir with a file");
            panic!("conversion worker exploded without a crash dir");
        }
        other => panic!("unknown child mode: {other}"),
    }
}

#[test]
fn panic_writes_crash_artifact() {
    let data_dir = tempdir().expect("tempdir");
    let output = spawn_panicking_child("writable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let mut artifacts: Vec<PathBuf> = fs::read_dir(crash_dir_of(data_dir.path()))
        .expect("read crash directory")
        .map(|entry| entry.expect("crash dir entry").path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    artifacts.sort();
    let newest = artifacts.last().expect("expected a crash artifact");
    let contents = fs::read_to_string(newest).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=conversion worker exploded"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace_policy="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_without_double_panic() {
    let data_dir = tempdir().expect("tempdir");
    let output = spawn_panicking_child("unwritable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("conversion worker exploded without a crash dir"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
