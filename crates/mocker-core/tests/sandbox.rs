//! End-to-end runs of the launcher.
//!
//! These tests need a Linux host with:
//! - Unprivileged user namespaces enabled (or root)
//! - A writable cgroup v2 hierarchy with the memory and cpu controllers
//!   delegated (MOCKER_CGROUP_ROOT can point at a delegated subtree)
//! - busybox on PATH or in MOCKER_BUSYBOX
//!
//! Each test skips itself when one of those is missing. The sandboxed
//! command's stdout is inherited, so results are observed through exit codes.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use mocker_core::config::default_busybox_path;
use mocker_core::isolation::cgroups::default_cgroup_root;
use mocker_core::{
    CgroupsConfig, ExitOutcome, FAILURE_EXIT_CODE, IdMap, MockerError, Rootfs, RootfsProvisioner,
    Sandbox, SandboxSpec, SandboxSpecBuilder,
};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

fn cgroups(test: &str) -> CgroupsConfig {
    CgroupsConfig::new(
        default_cgroup_root(),
        format!("mocker-test-{}-{test}", std::process::id()),
    )
}

fn provision() -> Option<Rootfs> {
    let busybox = default_busybox_path()?;
    RootfsProvisioner::busybox(busybox).provision().ok()
}

/// Whether a trivial container can be started on this host
fn available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let Some(rootfs) = provision() else {
            eprintln!("busybox not found");
            return false;
        };
        let spec = SandboxSpec::builder("true")
            .rootfs(rootfs.path())
            .build()
            .expect("preflight spec");
        match Sandbox::new(spec, cgroups("preflight")).with_rootfs(rootfs).run() {
            Ok(outcome) if outcome.is_success() => true,
            Ok(outcome) => {
                eprintln!("preflight container exited with {}", outcome.exit_code);
                false
            }
            Err(e) => {
                eprintln!("preflight container failed: {e}");
                false
            }
        }
    })
}

/// A finished run plus the paths it was supposed to clean up
struct Run {
    result: mocker_core::Result<ExitOutcome>,
    rootfs: PathBuf,
    cgroup: PathBuf,
}

fn run_with(
    test: &str,
    command: &str,
    args: &[&str],
    customize: impl FnOnce(SandboxSpecBuilder) -> SandboxSpecBuilder,
) -> Option<Run> {
    if !available() {
        eprintln!("Skipping {test}: containers unavailable on this host");
        return None;
    }

    let rootfs = provision().expect("provision rootfs");
    let root = rootfs.path().to_path_buf();
    let spec = customize(
        SandboxSpec::builder(command)
            .args(args.iter().copied())
            .rootfs(&root),
    )
    .build()
    .expect("valid spec");

    let cgroups = cgroups(test);
    let cgroup = cgroups.path();
    let result = Sandbox::new(spec, cgroups).with_rootfs(rootfs).run();

    Some(Run {
        result,
        rootfs: root,
        cgroup,
    })
}

fn shell(test: &str, script: &str) -> Option<Run> {
    run_with(test, "sh", &["-c", script], |builder| builder)
}

fn exit_code(run: &Run) -> i32 {
    match &run.result {
        Ok(outcome) => outcome.exit_code,
        Err(e) => panic!("sandbox failed to start: {e}"),
    }
}

fn assert_cleaned_up(run: &Run) {
    assert!(!run.rootfs.exists(), "rootfs {} left behind", run.rootfs.display());
    assert!(!run.cgroup.exists(), "cgroup {} left behind", run.cgroup.display());
}

#[test]
fn test_command_runs_as_pid_one() {
    let Some(run) = shell("pid-one", "test $$ -eq 1") else {
        return;
    };
    assert_eq!(exit_code(&run), 0);

    // the launcher sees the same process under its host pid
    let host_pid = run.result.as_ref().ok().and_then(|outcome| outcome.host_pid);
    assert!(
        host_pid.is_some_and(|pid| pid > 1),
        "expected a host pid above 1, got {host_pid:?}"
    );
}

#[test]
fn test_proc_hides_host_processes() {
    let script = format!("test -d /proc/1 && test ! -e /proc/{}", std::process::id());
    let Some(run) = shell("proc", &script) else {
        return;
    };
    assert_eq!(exit_code(&run), 0);
}

#[test]
fn test_exit_code_propagates() {
    let Some(run) = shell("exit-seven", "exit 7") else {
        return;
    };
    assert_eq!(exit_code(&run), 7);
    assert_cleaned_up(&run);
}

#[test]
fn test_root_has_no_host_entries() {
    let Some(run) = shell(
        "root-listing",
        "test ! -e /etc && test ! -e /usr && test ! -e /home && test -x /bin/busybox",
    ) else {
        return;
    };
    assert_eq!(exit_code(&run), 0);
}

#[test]
fn test_hostname_is_applied() {
    let Some(run) = run_with(
        "hostname",
        "sh",
        &["-c", "test \"$(hostname)\" = sandbox-host"],
        |builder| builder.hostname("sandbox-host"),
    ) else {
        return;
    };
    assert_eq!(exit_code(&run), 0);
}

#[test]
fn test_exec_failure_reports_failure_and_cleans_up() {
    let Some(run) = run_with("exec-missing", "/bin/no-such-command", &[], |builder| builder)
    else {
        return;
    };
    assert_eq!(exit_code(&run), FAILURE_EXIT_CODE);
    assert_cleaned_up(&run);
}

#[test]
fn test_killed_command_maps_to_failure() {
    if !available() {
        eprintln!("Skipping killed-command: containers unavailable on this host");
        return;
    }

    let cgroups = cgroups("killed");
    let procs = cgroups.path().join("cgroup.procs");

    let runner = thread::spawn(move || run_with("killed", "sleep", &["30"], |builder| builder));

    // the host pid shows up in cgroup.procs; wait until it has exec'd so
    // the kill cannot race the start barrier
    let deadline = Instant::now() + Duration::from_secs(10);
    let pid = loop {
        let listed = std::fs::read_to_string(&procs).unwrap_or_default();
        let pid = listed
            .lines()
            .next()
            .and_then(|line| line.trim().parse().ok())
            .map(Pid::from_raw);
        if let Some(pid) = pid {
            let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).unwrap_or_default();
            if comm.trim() == "sleep" {
                break pid;
            }
        }
        assert!(Instant::now() < deadline, "sandboxed sleep never started");
        thread::sleep(Duration::from_millis(20));
    };
    kill(pid, Signal::SIGKILL).expect("kill sandbox");

    let run = runner.join().expect("runner thread").expect("sandbox ran");
    let outcome = run.result.as_ref().expect("sandbox started");
    assert_eq!(outcome.exit_code, FAILURE_EXIT_CODE);
    assert_eq!(outcome.signal, Some(Signal::SIGKILL as i32));
    assert_cleaned_up(&run);
}

#[test]
fn test_memory_ceiling_stops_large_allocation() {
    let Some(run) = run_with(
        "memory",
        "sh",
        &["-c", "x=$(yes | head -c 67108864); test ${#x} -eq 67108864"],
        |builder| builder.memory_limit(16 * 1024 * 1024),
    ) else {
        return;
    };
    assert_ne!(exit_code(&run), 0);
    assert_cleaned_up(&run);
}

#[test]
fn test_cpu_quota_throttles_busy_loop() {
    let Some(run) = run_with(
        "cpu",
        "sh",
        &[
            "-c",
            "end=$(($(date +%s)+1)); while [ $(date +%s) -lt $end ]; do :; done",
        ],
        |builder| builder.cpu_quota(10_000, 100_000),
    ) else {
        return;
    };
    assert_eq!(exit_code(&run), 0);

    let outcome = run.result.as_ref().expect("sandbox started");
    let Some(stat) = outcome.cpu_stat.filter(|stat| stat.nr_periods > 0) else {
        eprintln!("Skipping cpu throttling: cpu controller not enabled for the group");
        return;
    };
    assert!(stat.nr_throttled > 0, "busy loop was never throttled: {stat:?}");
    assert_cleaned_up(&run);
}

#[test]
fn test_rejected_id_map_aborts_launch() {
    // overlapping ranges are refused by the kernel for every caller
    let map: IdMap = "0 0 10,5 100 10".parse().expect("well-formed map");
    let Some(run) = run_with("bad-map", "true", &[], |builder| builder.uid_map(map)) else {
        return;
    };
    assert!(
        matches!(run.result, Err(MockerError::Mapping(_))),
        "expected a mapping error, got {:?}",
        run.result
    );
    assert_cleaned_up(&run);
}
