use crate::afl::{SEED_PLACEHOLDER, replace_placeholder};
use crate::config::{MemLimit, ReplaySettings};
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Errors raised while replaying a single seed.
///
/// All of these are per-seed recoverable from the batch's point of view: the
/// failing seed is excluded from downstream aggregation and sibling replays
/// continue.
#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    /// The trace generator could not be spawned at all.
    #[error("Failed to spawn `{tool}`: {source}")]
    Spawn {
        tool: PathBuf,
        source: std::io::Error,
    },

    /// The run completed but left no trace file behind. This indicates the
    /// target crashed before any trace flush or the instrumentation is
    /// broken, and is distinct from a timeout.
    #[error("No coverage trace produced for `{seed}`: {stderr}")]
    MissingTrace { seed: PathBuf, stderr: String },

    /// A trace file line did not match the `edge:count` format.
    #[error("Malformed trace line {line} in `{path}`")]
    InvalidTrace { path: PathBuf, line: usize },

    #[error("Replay I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to build replay worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Outcome classification of a single replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Ok,
    /// The run exceeded its time budget and was killed. The observation
    /// carries zero coverage.
    TimedOut,
}

/// The result of replaying one seed: a sparse edge-count map plus timing and
/// size metadata. Edges never hit are absent from the map.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageObservation {
    pub edges: BTreeMap<u32, u32>,
    pub exec_time_ms: f64,
    pub byte_size: u64,
    pub status: ReplayStatus,
}

impl CoverageObservation {
    /// An observation that recorded no coverage at all. Empty observations
    /// are logged and excluded from merges rather than treated as failures.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// How the seed reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDelivery {
    /// Seed bytes are piped to the child's stdin. Selected when the argument
    /// list carries no `@@` placeholder.
    Stdin,
    /// The `@@` placeholder in the argument list is replaced with the seed
    /// path.
    FileArg,
}

/// Extra wait granted to the trace tool beyond the target's time budget, so
/// a run finishing just inside the budget is not killed before the tool can
/// flush its trace. The tool enforces the target budget itself via `-t`.
const TRACE_FLUSH_MARGIN: Duration = Duration::from_millis(500);

/// Polls a spawned child until it exits or the deadline passes.
///
/// Returns `Ok(None)` on deadline expiry; the caller decides how to
/// terminate the child.
pub(crate) fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let start_time = Instant::now();

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if start_time.elapsed() > timeout {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Feeds seed bytes to the child's stdin from a separate thread.
///
/// The write must not happen on the waiting thread: a seed larger than the
/// pipe buffer fed to a target that never drains stdin would block there for
/// the child's entire lifetime, bypassing the timed wait. Once the child is
/// reaped the pipe closes and the writer unblocks with a broken-pipe error.
pub(crate) fn spawn_stdin_writer(
    child: &mut Child,
    seed_bytes: Vec<u8>,
) -> Option<std::thread::JoinHandle<()>> {
    child.stdin.take().map(|mut stdin| {
        std::thread::spawn(move || {
            // A write error usually means the child exited early; the trace
            // check on the waiting side surfaces the real failure.
            if let Err(e) = stdin.write_all(&seed_bytes) {
                debug!(error = %e, "stdin write failed");
            }
        })
    })
}

pub(crate) fn drain_stderr(child: &mut Child) -> String {
    let mut stderr = String::new();
    if let Some(mut handle) = child.stderr.take() {
        let _ = handle.read_to_string(&mut stderr);
    }
    stderr.trim().to_string()
}

/// Replays seeds through an external trace generator, one target invocation
/// per seed, and parses the resulting `edge:count` traces.
///
/// Replays are independent: each run writes its trace to a distinct
/// random-suffixed file in the shared trace directory, so parallel workers
/// never race on an output path.
pub struct SeedReplayer {
    tool: PathBuf,
    target: PathBuf,
    target_args: Vec<String>,
    delivery: InputDelivery,
    timeout: Duration,
    mem_limit: Option<MemLimit>,
    quiet: bool,
    jobs: usize,
    trace_dir: PathBuf,
}

impl SeedReplayer {
    /// Creates a replayer for one trial.
    ///
    /// Input delivery is decided here: an `@@` placeholder in `target_args`
    /// selects file-based delivery, otherwise seeds are piped to stdin.
    pub fn new(
        tool: PathBuf,
        target: PathBuf,
        target_args: Vec<String>,
        settings: &ReplaySettings,
        trace_dir: PathBuf,
    ) -> Self {
        let delivery = if target_args.iter().any(|a| a == SEED_PLACEHOLDER) {
            InputDelivery::FileArg
        } else {
            InputDelivery::Stdin
        };

        Self {
            tool,
            target,
            target_args,
            delivery,
            timeout: Duration::from_millis(settings.timeout_ms),
            mem_limit: settings.mem_limit,
            quiet: settings.quiet,
            jobs: settings.jobs,
            trace_dir,
        }
    }

    pub fn delivery(&self) -> InputDelivery {
        self.delivery
    }

    /// Path the trace for `seed` will be written to. Random-suffixed so
    /// concurrent workers sharing the trace directory cannot collide.
    fn trace_path(&self, seed: &Path) -> PathBuf {
        let stem = seed
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "seed".to_string());
        let rand_id: u32 = rand::rng().random_range(0..100_000);
        self.trace_dir.join(format!("{rand_id:05}-{stem}.trace"))
    }

    /// Replays one seed and returns its coverage observation.
    ///
    /// A run that exceeds the time budget is killed and reported as a
    /// zero-coverage observation with [`ReplayStatus::TimedOut`]; a run that
    /// completes without leaving a trace file is a hard error for this seed.
    pub fn replay(&self, seed: &Path) -> Result<CoverageObservation, ReplayError> {
        let byte_size = std::fs::metadata(seed)?.len();
        if byte_size == 0 {
            warn!(seed = %seed.display(), "seed is empty");
        }

        let trace_path = self.trace_path(seed);

        let mut cmd = Command::new(&self.tool);
        cmd.arg("-t").arg(self.timeout.as_millis().to_string());
        if let Some(limit) = &self.mem_limit {
            cmd.arg("-m").arg(limit.to_string());
        }
        if self.quiet {
            cmd.arg("-q");
        }
        cmd.arg("-o").arg(&trace_path);
        cmd.arg("--").arg(&self.target);

        match self.delivery {
            InputDelivery::FileArg => {
                let (args, _) = replace_placeholder(&self.target_args, seed);
                cmd.args(args);
                cmd.stdin(Stdio::null());
            }
            InputDelivery::Stdin => {
                cmd.args(&self.target_args);
                cmd.stdin(Stdio::piped());
            }
        }

        // Target output is sunk; the tool's own stderr is kept for diagnosis.
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ReplayError::Spawn {
            tool: self.tool.clone(),
            source,
        })?;

        let writer = if self.delivery == InputDelivery::Stdin {
            spawn_stdin_writer(&mut child, std::fs::read(seed)?)
        } else {
            None
        };

        let start_time = Instant::now();
        let exit = wait_with_timeout(&mut child, self.timeout + TRACE_FLUSH_MARGIN)?;
        let exec_time_ms = start_time.elapsed().as_secs_f64() * 1000.0;

        let Some(status) = exit else {
            warn!(seed = %seed.display(), "replay timed out, killing");
            child.kill()?;
            child.wait()?;
            if let Some(writer) = writer {
                let _ = writer.join();
            }
            let _ = std::fs::remove_file(&trace_path);
            return Ok(CoverageObservation {
                edges: BTreeMap::new(),
                exec_time_ms,
                byte_size,
                status: ReplayStatus::TimedOut,
            });
        };

        if let Some(writer) = writer {
            let _ = writer.join();
        }

        let stderr = drain_stderr(&mut child);
        if !status.success() {
            debug!(seed = %seed.display(), %status, stderr, "trace generator exited abnormally");
        }

        if !trace_path.is_file() {
            return Err(ReplayError::MissingTrace {
                seed: seed.to_path_buf(),
                stderr,
            });
        }

        let edges = parse_trace(&trace_path)?;
        Ok(CoverageObservation {
            edges,
            exec_time_ms,
            byte_size,
            status: ReplayStatus::Ok,
        })
    }

    /// Replays a batch of seeds in parallel over the configured worker count.
    ///
    /// Per-seed failures are logged and returned alongside the successes;
    /// they never abort sibling replays.
    pub fn replay_batch(
        &self,
        seeds: &[PathBuf],
    ) -> Result<Vec<(PathBuf, Result<CoverageObservation, ReplayError>)>, ReplayError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()?;

        let results = pool.install(|| {
            seeds
                .par_iter()
                .map(|seed| {
                    let result = self.replay(seed);
                    if let Err(e) = &result {
                        warn!(seed = %seed.display(), error = %e, "replay failed, excluding seed");
                    }
                    (seed.clone(), result)
                })
                .collect()
        });

        Ok(results)
    }
}

/// Parses an `edge:count` trace file into a sparse edge map.
fn parse_trace(path: &Path) -> Result<BTreeMap<u32, u32>, ReplayError> {
    let content = std::fs::read_to_string(path)?;
    let mut edges = BTreeMap::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = line.split_once(':').and_then(|(edge, count)| {
            Some((edge.parse::<u32>().ok()?, count.parse::<u32>().ok()?))
        });
        match parsed {
            Some((edge, count)) => {
                edges.insert(edge, count);
            }
            None => {
                return Err(ReplayError::InvalidTrace {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                });
            }
        }
    }

    Ok(edges)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// Writes an executable fake trace generator that understands the
    /// `-t/-m/-q/-o -- target args...` calling convention.
    fn write_fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let script = format!("#!/bin/sh\n{body}\n");
        fs::write(&path, script).expect("Failed to write fake tool");
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    // Extracts the argument following -o, then runs the given payload.
    const FIND_OUT: &str = r#"
out=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "-o" ]; then out="$arg"; fi
    prev="$arg"
done
"#;

    fn replayer(tool: PathBuf, args: Vec<&str>, timeout_ms: u64, dir: &Path) -> SeedReplayer {
        let settings = ReplaySettings {
            timeout_ms,
            mem_limit: None,
            quiet: false,
            jobs: 2,
        };
        SeedReplayer::new(
            tool,
            PathBuf::from("/bin/true"),
            args.into_iter().map(String::from).collect(),
            &settings,
            dir.to_path_buf(),
        )
    }

    #[test]
    fn replay_parses_trace_into_sparse_edges() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(
            dir.path(),
            "fake-showmap",
            &format!("{FIND_OUT}printf '1:1\\n7:3\\n42:255\\n' > \"$out\""),
        );
        let seed = dir.path().join("id:000000");
        fs::write(&seed, b"hello").unwrap();

        let replayer = replayer(tool, vec!["@@"], 2000, dir.path());
        assert_eq!(replayer.delivery(), InputDelivery::FileArg);

        let obs = replayer.replay(&seed).expect("Replay should succeed");
        assert_eq!(obs.status, ReplayStatus::Ok);
        assert_eq!(obs.byte_size, 5);
        assert_eq!(
            obs.edges,
            BTreeMap::from([(1, 1), (7, 3), (42, 255)]),
        );
        assert!(obs.exec_time_ms >= 0.0);
    }

    #[test]
    fn replay_timeout_yields_zero_coverage_observation() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(dir.path(), "fake-showmap", "sleep 5");
        let seed = dir.path().join("id:000001");
        fs::write(&seed, b"x").unwrap();

        let replayer = replayer(tool, vec!["@@"], 100, dir.path());
        let obs = replayer.replay(&seed).expect("Timeout is not a hard error");
        assert_eq!(obs.status, ReplayStatus::TimedOut);
        assert!(obs.is_empty());
    }

    #[test]
    fn missing_trace_is_a_hard_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(
            dir.path(),
            "fake-showmap",
            "echo 'target crashed before flush' >&2; exit 1",
        );
        let seed = dir.path().join("id:000002");
        fs::write(&seed, b"x").unwrap();

        let replayer = replayer(tool, vec!["@@"], 2000, dir.path());
        match replayer.replay(&seed) {
            Err(ReplayError::MissingTrace { stderr, .. }) => {
                assert!(stderr.contains("target crashed before flush"));
            }
            other => panic!("Expected MissingTrace, got {other:?}"),
        }
    }

    #[test]
    fn stdin_delivery_is_selected_without_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(
            dir.path(),
            "fake-showmap",
            // Echo one edge per stdin byte count so delivery is observable.
            &format!("{FIND_OUT}n=$(wc -c); printf '1:%d\\n' \"$(($n))\" > \"$out\""),
        );
        let seed = dir.path().join("id:000003");
        fs::write(&seed, b"abcd").unwrap();

        let replayer = replayer(tool, vec!["--no-file-arg"], 2000, dir.path());
        assert_eq!(replayer.delivery(), InputDelivery::Stdin);

        let obs = replayer.replay(&seed).expect("Replay should succeed");
        assert_eq!(obs.edges.get(&1), Some(&4));
    }

    #[test]
    fn oversized_stdin_seed_cannot_outlive_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        // Never reads stdin and outlives the deadline: the seed exceeds the
        // pipe buffer, so a blocking write on the waiting thread would stall
        // until the sleep finishes.
        let tool = write_fake_tool(dir.path(), "fake-showmap", "sleep 3");
        let seed = dir.path().join("id:000004");
        fs::write(&seed, vec![0u8; 1 << 20]).unwrap();

        let replayer = replayer(tool, vec!["--stdin"], 100, dir.path());
        assert_eq!(replayer.delivery(), InputDelivery::Stdin);

        let start = Instant::now();
        let obs = replayer.replay(&seed).expect("Timeout is not a hard error");
        assert_eq!(obs.status, ReplayStatus::TimedOut);
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "Replay must be bounded by the timeout, took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn tool_gets_headroom_to_flush_the_trace() {
        let dir = tempfile::tempdir().unwrap();
        // Finishes after the target budget but well inside the flush margin.
        let tool = write_fake_tool(
            dir.path(),
            "fake-showmap",
            &format!("{FIND_OUT}sleep 0.3\nprintf '4:1\\n' > \"$out\""),
        );
        let seed = dir.path().join("id:000005");
        fs::write(&seed, b"x").unwrap();

        let replayer = replayer(tool, vec!["@@"], 100, dir.path());
        let obs = replayer.replay(&seed).expect("Replay should succeed");
        assert_eq!(obs.status, ReplayStatus::Ok);
        assert_eq!(obs.edges.get(&4), Some(&1));
    }

    #[test]
    fn batch_continues_past_failing_seeds() {
        let dir = tempfile::tempdir().unwrap();
        // Fails for the seed named id:000001, succeeds otherwise.
        let body = format!(
            "{FIND_OUT}case \"$@\" in *id:000001*) exit 1 ;; *) printf '9:1\\n' > \"$out\" ;; esac"
        );
        let tool = write_fake_tool(dir.path(), "fake-showmap", &body);

        let mut seeds = Vec::new();
        for name in ["id:000000", "id:000001", "id:000002"] {
            let path = dir.path().join(name);
            fs::write(&path, b"x").unwrap();
            seeds.push(path);
        }

        let replayer = replayer(tool, vec!["@@"], 2000, dir.path());
        let results = replayer.replay_batch(&seeds).expect("Pool should build");

        assert_eq!(results.len(), 3);
        let ok_count = results.iter().filter(|(_, r)| r.is_ok()).count();
        let err_count = results.iter().filter(|(_, r)| r.is_err()).count();
        assert_eq!(ok_count, 2, "Two seeds should replay cleanly");
        assert_eq!(err_count, 1, "The failing seed must not abort siblings");
    }

    #[test]
    fn malformed_trace_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("bad.trace");
        fs::write(&trace, "1:1\nnot-a-pair\n").unwrap();
        match parse_trace(&trace) {
            Err(ReplayError::InvalidTrace { line, .. }) => assert_eq!(line, 2),
            other => panic!("Expected InvalidTrace, got {other:?}"),
        }
    }
}
