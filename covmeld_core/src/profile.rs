use crate::afl::{SEED_PLACEHOLDER, replace_placeholder};
use crate::config::PipelineSettings;
use crate::replay::{InputDelivery, drain_stderr, spawn_stdin_writer, wait_with_timeout};
use rand::Rng;
use rayon::prelude::*;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Errors raised by the profile merge pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Not a single seed produced a raw profile. Trial-scoped: the trial is
    /// reported as failed without crashing a multi-trial run.
    #[error("No coverage profiles generated")]
    NoProfiles,

    /// One seed's run left no raw profile behind. Per-seed recoverable.
    #[error("Failed to create raw coverage profile for `{seed}`: {stderr}")]
    MissingProfile { seed: PathBuf, stderr: String },

    #[error("Failed to spawn `{tool}`: {source}")]
    Spawn {
        tool: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to merge profile data: {0}")]
    MergeFailed(String),

    #[error("Failed to export coverage: {0}")]
    ExportFailed(String),

    /// The export JSON did not match the expected region summary shape.
    #[error("Malformed coverage export: {0}")]
    MalformedExport(String),

    /// Full (non-summary) export was requested without a destination to
    /// receive it.
    #[error("Full export requested without an output destination")]
    FullExportWithoutOutput,

    #[error("Pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to build pipeline worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Aggregate region totals extracted from a merged coverage export.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSummary {
    pub covered: u64,
    pub count: u64,
}

impl RegionSummary {
    /// Region coverage as a percentage.
    pub fn percent(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.covered as f64 / self.count as f64 * 100.0
    }
}

#[derive(Deserialize, Debug)]
struct ExportTotals {
    regions: RegionSummary,
}

#[derive(Deserialize, Debug)]
struct ExportData {
    totals: ExportTotals,
}

#[derive(Deserialize, Debug)]
struct CoverageExport {
    data: Vec<ExportData>,
}

/// Parses a coverage export document of the shape
/// `{"data": [{"totals": {"regions": {"covered": N, "count": M}}}]}`.
pub fn parse_region_summary(json: &[u8]) -> Result<RegionSummary, PipelineError> {
    let export: CoverageExport =
        serde_json::from_slice(json).map_err(|e| PipelineError::MalformedExport(e.to_string()))?;
    let data = export
        .data
        .first()
        .ok_or_else(|| PipelineError::MalformedExport("empty `data` array".to_string()))?;
    Ok(data.totals.regions)
}

/// Reads a region summary from a JSON file on disk.
pub fn read_region_json(path: &Path) -> Result<RegionSummary, PipelineError> {
    let bytes = std::fs::read(path)?;
    parse_region_summary(&bytes)
}

/// Scratch directory root. Prefers in-memory filesystems to avoid I/O
/// bottlenecks during high seed-count merges.
pub fn scratch_root() -> PathBuf {
    for candidate in ["/dev/shm", "/run/shm"] {
        let path = Path::new(candidate);
        if path.exists() {
            return path.to_path_buf();
        }
    }
    std::env::temp_dir()
}

/// What the export phase produces.
///
/// Summary-only is the default; full per-file detail is only meaningful with
/// a destination to receive it.
#[derive(Debug, Clone)]
pub struct ProfileExport {
    pub summary_only: bool,
    pub output: Option<PathBuf>,
}

impl Default for ProfileExport {
    fn default() -> Self {
        Self {
            summary_only: true,
            output: None,
        }
    }
}

impl ProfileExport {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.summary_only && self.output.is_none() {
            return Err(PipelineError::FullExportWithoutOutput);
        }
        Ok(())
    }
}

/// Generates per-seed raw coverage profiles against an instrumented target,
/// merges them with an external merge tool, and exports one aggregate region
/// summary.
pub struct ProfilePipeline {
    merge_tool: PathBuf,
    export_tool: PathBuf,
    target: PathBuf,
    target_args: Vec<String>,
    delivery: InputDelivery,
    jobs: usize,
    timeout: Option<Duration>,
    profile_env: String,
}

impl ProfilePipeline {
    pub fn new(
        merge_tool: PathBuf,
        export_tool: PathBuf,
        target: PathBuf,
        target_args: Vec<String>,
        settings: &PipelineSettings,
    ) -> Self {
        let delivery = if target_args.iter().any(|a| a == SEED_PLACEHOLDER) {
            InputDelivery::FileArg
        } else {
            InputDelivery::Stdin
        };

        Self {
            merge_tool,
            export_tool,
            target,
            target_args,
            delivery,
            jobs: settings.jobs,
            timeout: settings.timeout_secs.map(Duration::from_secs),
            profile_env: settings.profile_env.clone(),
        }
    }

    /// Runs the full generate → merge → export pipeline over every seed
    /// found under a `queue/` directory in `input_dir`.
    ///
    /// All intermediate artifacts live in a scratch directory that is
    /// removed on completion or failure.
    pub fn run(
        &self,
        input_dir: &Path,
        export: &ProfileExport,
    ) -> Result<RegionSummary, PipelineError> {
        export.validate()?;

        let seeds = collect_queue_seeds(input_dir);
        let scratch = tempfile::TempDir::new_in(scratch_root())?;

        info!(input = %input_dir.display(), seeds = seeds.len(), "generating raw coverage profiles");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()?;
        let results: Vec<(PathBuf, Result<Option<PathBuf>, PipelineError>)> = pool.install(|| {
            seeds
                .par_iter()
                .map(|seed| {
                    (
                        seed.clone(),
                        self.generate_raw_profile(seed, scratch.path()),
                    )
                })
                .collect()
        });

        let mut profraws = Vec::new();
        for (seed, result) in results {
            match result {
                Ok(Some(profraw)) => profraws.push(profraw),
                Ok(None) => {}
                Err(e) => warn!(seed = %seed.display(), error = %e, "excluding seed from merge"),
            }
        }
        info!(profiles = profraws.len(), "generated coverage profiles");

        if profraws.is_empty() {
            return Err(PipelineError::NoProfiles);
        }

        // Weighted profile list consumed by the merge tool.
        let seed_list = scratch.path().join("seeds.txt");
        let mut listf = std::fs::File::create(&seed_list)?;
        for profraw in &profraws {
            writeln!(listf, "1,{}", profraw.display())?;
        }
        drop(listf);

        info!("merging raw coverage profiles");
        let profdata = scratch.path().join("merged.profdata");
        self.merge_profiles(&seed_list, &profdata)?;

        info!("generating coverage export");
        self.export_profile(&profdata, export)
    }

    /// Replays one seed through the instrumented target, directing the raw
    /// profile to a distinct random-suffixed path via the configured
    /// environment variable.
    fn generate_raw_profile(
        &self,
        seed: &Path,
        scratch: &Path,
    ) -> Result<Option<PathBuf>, PipelineError> {
        if std::fs::metadata(seed)?.len() == 0 {
            warn!(seed = %seed.display(), "seed is empty");
        }

        let stem = seed
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "seed".to_string());
        let rand_id: u32 = rand::rng().random_range(0..100_000);
        let profraw = scratch.join(format!("{rand_id:05}-{stem}.profraw"));

        let mut cmd = Command::new(&self.target);
        cmd.env(&self.profile_env, &profraw);

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
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| PipelineError::Spawn {
            tool: self.target.clone(),
            source,
        })?;

        let writer = if self.delivery == InputDelivery::Stdin {
            spawn_stdin_writer(&mut child, std::fs::read(seed)?)
        } else {
            None
        };

        let exit = match self.timeout {
            Some(timeout) => wait_with_timeout(&mut child, timeout)?,
            None => Some(child.wait()?),
        };

        let stderr = match exit {
            Some(status) => {
                let stderr = drain_stderr(&mut child);
                if !status.success() {
                    debug!(seed = %seed.display(), %status, stderr, "target exited abnormally");
                }
                stderr
            }
            None => {
                warn!(seed = %seed.display(), "target timed out, killing");
                child.kill()?;
                child.wait()?;
                drain_stderr(&mut child)
            }
        };
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !profraw.is_file() {
            return Err(PipelineError::MissingProfile {
                seed: seed.to_path_buf(),
                stderr,
            });
        }
        if std::fs::metadata(&profraw)?.len() == 0 {
            warn!(seed = %seed.display(), "zero-size raw profile, excluding from merge");
            return Ok(None);
        }

        Ok(Some(profraw))
    }

    /// One merge-tool invocation over the full profile set; the tool's own
    /// concurrency is delegated via its job-count flag.
    fn merge_profiles(&self, seed_list: &Path, profdata: &Path) -> Result<(), PipelineError> {
        let output = Command::new(&self.merge_tool)
            .arg("merge")
            .arg("-sparse")
            .arg("-num-threads")
            .arg(self.jobs.to_string())
            .arg("-f")
            .arg(seed_list)
            .arg("-o")
            .arg(profdata)
            .output()
            .map_err(|source| PipelineError::Spawn {
                tool: self.merge_tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(PipelineError::MergeFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn export_profile(
        &self,
        profdata: &Path,
        export: &ProfileExport,
    ) -> Result<RegionSummary, PipelineError> {
        let mut cmd = Command::new(&self.export_tool);
        cmd.arg("export");
        if export.summary_only {
            cmd.arg("-summary-only");
        }
        cmd.arg(&self.target)
            .arg("-instr-profile")
            .arg(profdata)
            .arg("-format")
            .arg("text");

        let output = cmd.output().map_err(|source| PipelineError::Spawn {
            tool: self.export_tool.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(PipelineError::ExportFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        if let Some(destination) = &export.output {
            info!(output = %destination.display(), "saving coverage export");
            std::fs::write(destination, &output.stdout)?;
        }

        parse_region_summary(&output.stdout)
    }
}

/// Collects every seed file nested under a `queue/` directory, at any depth.
pub fn collect_queue_seeds(input_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(input_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n == "queue")
                    .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn region_summary_parses_expected_shape() {
        let json = br#"{"data": [{"totals": {"regions": {"covered": 50, "count": 200}}}]}"#;
        let summary = parse_region_summary(json).expect("Summary should parse");
        assert_eq!(
            summary,
            RegionSummary {
                covered: 50,
                count: 200
            }
        );
        assert_eq!(summary.percent(), 25.0);
    }

    #[test]
    fn region_summary_tolerates_extra_fields() {
        let json = br#"{
            "version": "2.0.1",
            "type": "llvm.coverage.json.export",
            "data": [{
                "files": [],
                "totals": {
                    "functions": {"count": 10, "covered": 5, "percent": 50},
                    "regions": {"covered": 3, "count": 12, "notcovered": 9, "percent": 25}
                }
            }]
        }"#;
        let summary = parse_region_summary(json).expect("Summary should parse");
        assert_eq!(summary.covered, 3);
        assert_eq!(summary.count, 12);
    }

    #[test]
    fn malformed_export_is_rejected() {
        match parse_region_summary(b"{not json") {
            Err(PipelineError::MalformedExport(_)) => {}
            other => panic!("Expected MalformedExport, got {other:?}"),
        }
        match parse_region_summary(br#"{"data": []}"#) {
            Err(PipelineError::MalformedExport(msg)) => assert!(msg.contains("data")),
            other => panic!("Expected MalformedExport, got {other:?}"),
        }
    }

    #[test]
    fn empty_region_count_gives_zero_percent() {
        let summary = RegionSummary {
            covered: 0,
            count: 0,
        };
        assert_eq!(summary.percent(), 0.0);
    }

    #[test]
    fn full_export_without_destination_is_rejected() {
        let export = ProfileExport {
            summary_only: false,
            output: None,
        };
        match export.validate() {
            Err(PipelineError::FullExportWithoutOutput) => {}
            other => panic!("Expected FullExportWithoutOutput, got {other:?}"),
        }

        let export = ProfileExport {
            summary_only: true,
            output: None,
        };
        assert!(export.validate().is_ok());
    }

    #[test]
    fn queue_seeds_are_collected_from_nested_trees() {
        let dir = tempfile::tempdir().unwrap();
        let node0 = dir.path().join("node0/queue");
        let node1 = dir.path().join("node1/queue");
        let crashes = dir.path().join("node0/crashes");
        fs::create_dir_all(&node0).unwrap();
        fs::create_dir_all(&node1).unwrap();
        fs::create_dir_all(&crashes).unwrap();

        fs::write(node0.join("id:000000"), b"a").unwrap();
        fs::write(node1.join("id:000000"), b"b").unwrap();
        fs::write(node1.join("id:000001"), b"c").unwrap();
        fs::write(crashes.join("id:000000"), b"d").unwrap();

        let mut seeds = collect_queue_seeds(dir.path());
        seeds.sort();
        assert_eq!(seeds.len(), 3, "Only queue seeds are collected");
        assert!(seeds.iter().all(|s| s.parent().unwrap().ends_with("queue")));
    }

    #[test]
    fn scratch_root_is_usable() {
        let root = scratch_root();
        assert!(root.exists(), "Scratch root must exist: {root:?}");
    }

    #[cfg(unix)]
    mod pipeline_runs {
        use super::*;
        use crate::config::PipelineSettings;
        use std::os::unix::fs::PermissionsExt;

        /// A fake instrumented target that writes a fixed raw profile to the
        /// path given in the profile environment variable.
        fn write_fake_target(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-target");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn write_fake_llvm_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn seed_tree(dir: &Path, count: usize) -> PathBuf {
            let queue = dir.join("afl-out/queue");
            fs::create_dir_all(&queue).unwrap();
            for i in 0..count {
                fs::write(queue.join(format!("id:{i:06}")), b"seed").unwrap();
            }
            dir.join("afl-out")
        }

        #[test]
        fn pipeline_generates_merges_and_exports() {
            let dir = tempfile::tempdir().unwrap();
            let target = write_fake_target(dir.path(), r#"echo raw > "$LLVM_PROFILE_FILE""#);
            // The merge tool finds its -o argument and writes a merged file;
            // the export tool prints the region JSON shape.
            let merge = write_fake_llvm_tool(
                dir.path(),
                "fake-profdata",
                r#"
out=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "-o" ]; then out="$arg"; fi
    prev="$arg"
done
echo merged > "$out"
"#,
            );
            let export = write_fake_llvm_tool(
                dir.path(),
                "fake-cov",
                r#"echo '{"data":[{"totals":{"regions":{"covered":75,"count":300}}}]}'"#,
            );
            let input = seed_tree(dir.path(), 3);

            let settings = PipelineSettings {
                jobs: 2,
                timeout_secs: Some(5),
                profile_env: "LLVM_PROFILE_FILE".to_string(),
            };
            let pipeline = ProfilePipeline::new(
                merge,
                export,
                target,
                vec!["@@".to_string()],
                &settings,
            );

            let summary = pipeline
                .run(&input, &ProfileExport::default())
                .expect("Pipeline should succeed");
            assert_eq!(summary.covered, 75);
            assert_eq!(summary.count, 300);
            assert_eq!(summary.percent(), 25.0);
        }

        #[test]
        fn pipeline_with_no_profiles_reports_trial_failure() {
            let dir = tempfile::tempdir().unwrap();
            // Target never writes a profile.
            let target = write_fake_target(dir.path(), "exit 1");
            let merge = write_fake_llvm_tool(dir.path(), "fake-profdata", "exit 0");
            let export = write_fake_llvm_tool(dir.path(), "fake-cov", "exit 0");
            let input = seed_tree(dir.path(), 2);

            let settings = PipelineSettings::default();
            let pipeline = ProfilePipeline::new(
                merge,
                export,
                target,
                vec!["@@".to_string()],
                &settings,
            );

            match pipeline.run(&input, &ProfileExport::default()) {
                Err(PipelineError::NoProfiles) => {}
                other => panic!("Expected NoProfiles, got {other:?}"),
            }
        }
    }
}
