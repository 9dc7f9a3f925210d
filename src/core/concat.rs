//! Reassembles per-segment files into one artifact per route and kind.
//!
//! Segment directories live under the routes root as
//! `<route_base_id>--<index>`; they are always processed in ascending numeric
//! index order, whatever order the filesystem lists them in.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{CommandSpec, RunError, SharedRunner};
use crate::core::models::{ArtifactKind, RouteArtifact, RouteSegment};
use crate::core::progress::GrowthPoller;
use crate::error::{Result, SyncError, classify_write_error};

/// Split `2024-01-01--10-00-00--12` into base id and index.
pub fn parse_segment_name(name: &str) -> Option<(&str, u32)> {
    let (base, index) = name.rsplit_once("--")?;
    if base.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((base, index.parse().ok()?))
}

/// Free bytes available to unprivileged writers on the filesystem holding
/// `path` (or its nearest existing ancestor).
pub fn available_space(path: &Path) -> Result<u64> {
    let probe = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or(Path::new("."));
    let stat = nix::sys::statvfs::statvfs(probe).map_err(|errno| {
        SyncError::io(format!("statvfs {}", probe.display()), io::Error::from(errno))
    })?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

/// Fail early when `dir` cannot hold `needed` more bytes.
pub fn check_space(dir: &Path, needed: u64) -> Result<()> {
    match available_space(dir) {
        Ok(available) if available < needed => Err(SyncError::InsufficientLocalSpace {
            path: dir.to_path_buf(),
            needed,
            available,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Could not check free space");
            Ok(())
        }
    }
}

pub struct Concatenator {
    routes_root: PathBuf,
    runner: SharedRunner,
    progress_interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Concatenator {
    pub fn new(routes_root: impl Into<PathBuf>, runner: SharedRunner) -> Self {
        Self {
            routes_root: routes_root.into(),
            runner,
            progress_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3600),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn routes_root(&self) -> &Path {
        &self.routes_root
    }

    fn segment_dirs(&self) -> Result<Vec<(String, u32, PathBuf)>> {
        let entries = match fs::read_dir(&self.routes_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::io(
                    format!("list {}", self.routes_root.display()),
                    e,
                ));
            }
        };

        let mut dirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((base, index)) = parse_segment_name(&name) {
                dirs.push((base.to_string(), index, path));
            }
        }
        Ok(dirs)
    }

    /// Segments of one route in ascending numeric order.
    pub fn discover_segments(&self, route_base_id: &str) -> Result<Vec<RouteSegment>> {
        let mut segments: Vec<RouteSegment> = self
            .segment_dirs()?
            .into_iter()
            .filter(|(base, _, _)| base == route_base_id)
            .map(|(base, index, path)| RouteSegment {
                route_base_id: base,
                segment_index: index,
                path,
            })
            .collect();
        segments.sort_by_key(|s| s.segment_index);
        Ok(segments)
    }

    /// Distinct route ids present under the routes root, sorted.
    pub fn discover_routes(&self) -> Result<Vec<String>> {
        let routes: BTreeSet<String> = self
            .segment_dirs()?
            .into_iter()
            .map(|(base, _, _)| base)
            .collect();
        Ok(routes.into_iter().collect())
    }

    /// Build the `kind` artifact for a route in `output_dir`.
    ///
    /// Returns `None` when no segment has a file of this kind. On failure the
    /// partial output is removed and source segments are left untouched.
    pub async fn concatenate(
        &self,
        route_base_id: &str,
        kind: ArtifactKind,
        output_dir: &Path,
        keep_originals: bool,
    ) -> Result<Option<RouteArtifact>> {
        let inputs: Vec<(u32, PathBuf)> = self
            .discover_segments(route_base_id)?
            .iter()
            .filter_map(|s| s.file(kind).map(|f| (s.segment_index, f)))
            .collect();

        if inputs.is_empty() {
            debug!(route = %route_base_id, kind = %kind, "No segment files, skipping");
            return Ok(None);
        }

        let needed: u64 = inputs
            .iter()
            .filter_map(|(_, p)| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        fs::create_dir_all(output_dir)
            .map_err(|e| classify_write_error(output_dir, "create work directory", e))?;
        check_space(output_dir, needed)?;

        let output = output_dir.join(kind.artifact_file_name());
        info!(
            route = %route_base_id,
            kind = %kind,
            segments = inputs.len(),
            bytes = needed,
            "Concatenating"
        );

        let stop = self.cancel.child_token();
        let poller = GrowthPoller::new(&output, needed, self.progress_interval)
            .with_label(kind.to_string());
        let sampling = tokio::spawn(poller.run(stop.clone()));

        let result = match kind {
            ArtifactKind::Rlog => self.concat_bytes(kind, &inputs, &output, true).await,
            ArtifactKind::Qlog => self.concat_bytes(kind, &inputs, &output, false).await,
            ArtifactKind::Video(_) => self.concat_video(kind, &inputs, &output, output_dir).await,
        };

        stop.cancel();
        if let Err(e) = sampling.await {
            debug!(error = %e, "Progress sampler ended abnormally");
        }

        if let Err(e) = result {
            if let Err(rm) = fs::remove_file(&output) {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(path = %output.display(), error = %rm, "Failed to remove partial output");
                }
            }
            return Err(e);
        }

        let byte_size = fs::metadata(&output)
            .map_err(|e| SyncError::io(format!("stat {}", output.display()), e))?
            .len();

        if !keep_originals {
            remove_files(&inputs);
        }

        info!(route = %route_base_id, kind = %kind, byte_size, "Artifact ready");
        Ok(Some(RouteArtifact {
            route_base_id: route_base_id.to_string(),
            kind,
            path: output,
            byte_size,
        }))
    }

    /// Delete the source files of every artifact kind for a route. Only for
    /// after the route's artifacts have been delivered.
    pub fn remove_originals(&self, route_base_id: &str) -> Result<usize> {
        let mut files = Vec::new();
        for segment in self.discover_segments(route_base_id)? {
            for kind in ArtifactKind::all() {
                if let Some(path) = segment.file(kind) {
                    files.push((segment.segment_index, path));
                }
            }
        }
        let removed = remove_files(&files);
        info!(route = %route_base_id, removed, "Removed original segment files");
        Ok(removed)
    }

    async fn concat_bytes(
        &self,
        kind: ArtifactKind,
        inputs: &[(u32, PathBuf)],
        output: &Path,
        delimit: bool,
    ) -> Result<()> {
        let inputs = inputs.to_vec();
        let out_path = output.to_path_buf();
        let cancel = self.cancel.clone();

        let joined = tokio::task::spawn_blocking(move || {
            write_concatenated(&inputs, &out_path, delimit, &cancel)
        })
        .await
        .map_err(|e| SyncError::ConcatenationFailed {
            kind,
            detail: e.to_string(),
        })?;

        joined.map_err(|e| match e.kind() {
            io::ErrorKind::Interrupted => SyncError::Interrupted,
            _ if e.raw_os_error() == Some(libc::ENOSPC) => {
                classify_write_error(output, "write artifact", e)
            }
            _ => SyncError::ConcatenationFailed {
                kind,
                detail: e.to_string(),
            },
        })
    }

    async fn concat_video(
        &self,
        kind: ArtifactKind,
        inputs: &[(u32, PathBuf)],
        output: &Path,
        output_dir: &Path,
    ) -> Result<()> {
        // Ordered manifest first, then one lossless pass.
        let manifest = output_dir.join(format!(".{}.concat.txt", kind.artifact_file_name()));
        let body: String = inputs
            .iter()
            .map(|(_, path)| format!("file '{}'\n", escape_manifest(path)))
            .collect();
        fs::write(&manifest, body)
            .map_err(|e| classify_write_error(&manifest, "write manifest", e))?;

        let spec = CommandSpec::new("ffmpeg")
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(manifest.display().to_string())
            .args(["-c", "copy"])
            .arg(output.display().to_string())
            .timeout(self.timeout);

        let ran = tokio::select! {
            ran = self.runner.run(&spec) => Some(ran),
            _ = self.cancel.cancelled() => None,
        };
        if let Err(e) = fs::remove_file(&manifest) {
            debug!(path = %manifest.display(), error = %e, "Failed to remove manifest");
        }

        let failed = |detail: String| SyncError::ConcatenationFailed { kind, detail };
        match ran {
            None => Err(SyncError::Interrupted),
            Some(Err(RunError::Spawn { source, .. })) => {
                Err(failed(format!("failed to run ffmpeg: {}", source)))
            }
            Some(Err(e @ RunError::TimedOut { .. })) => Err(failed(e.to_string())),
            Some(Ok(out)) if !out.is_success() => Err(failed(out.summary())),
            Some(Ok(_)) if !output.is_file() => Err(failed("ffmpeg produced no output".into())),
            Some(Ok(_)) => Ok(()),
        }
    }
}

fn write_concatenated(
    inputs: &[(u32, PathBuf)],
    output: &Path,
    delimit: bool,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let file = File::create(output)?;
    let mut writer = BufWriter::with_capacity(1 << 20, file);

    for (index, path) in inputs {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        if delimit {
            writeln!(writer, "=== Segment {} ===", index)?;
        }
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut writer)?;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// ffmpeg concat manifests quote with `'`; an embedded quote closes, escapes
/// and reopens.
fn escape_manifest(path: &Path) -> String {
    path.display().to_string().replace('\'', "'\\''")
}

fn remove_files(inputs: &[(u32, PathBuf)]) -> usize {
    let mut removed = 0;
    for (_, path) in inputs {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed original segment file");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove segment file"),
        }
    }
    removed
}
