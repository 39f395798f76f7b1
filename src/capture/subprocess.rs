//! Still capture through external camera utilities
//!
//! Useful on boards where the camera only works through the vendor stack
//! (libcamera / the legacy MMAL tools). Each capture re-probes the candidate
//! utilities in order, writes into a private scratch directory and reads the
//! picture back into memory. Scratch files never outlive the capture call.

use super::{CaptureBackend, CaptureConfig, CaptureResult, Frame, FrameSource};
use crate::error::CaptureFailure;
use async_trait::async_trait;
use serde::Serialize;
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use uuid::Uuid;

/// External still-capture programs, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureUtility {
    /// Current Raspberry Pi camera stack
    LibcameraStill,
    /// Legacy MMAL camera stack
    Raspistill,
    /// Generic USB webcam grabber
    Fswebcam,
    /// Single frame grab through ffmpeg's v4l2 input
    Ffmpeg,
}

impl CaptureUtility {
    /// All utilities, most preferred first
    pub const ALL: [CaptureUtility; 4] = [
        CaptureUtility::LibcameraStill,
        CaptureUtility::Raspistill,
        CaptureUtility::Fswebcam,
        CaptureUtility::Ffmpeg,
    ];

    /// Executable name looked up on the search path
    pub fn program(self) -> &'static str {
        match self {
            CaptureUtility::LibcameraStill => "libcamera-still",
            CaptureUtility::Raspistill => "raspistill",
            CaptureUtility::Fswebcam => "fswebcam",
            CaptureUtility::Ffmpeg => "ffmpeg",
        }
    }

    /// Command line for one capture into `output`
    pub fn args(self, config: &CaptureConfig, output: &Path) -> Vec<OsString> {
        let width = config.width.to_string();
        let height = config.height.to_string();
        let quality = config.quality.to_string();
        let size = format!("{}x{}", config.width, config.height);
        let device = config.device_path();

        let args: Vec<OsString> = match self {
            CaptureUtility::LibcameraStill => vec![
                "-t".into(),
                "1".into(),
                "--width".into(),
                width.into(),
                "--height".into(),
                height.into(),
                "--quality".into(),
                quality.into(),
                "-o".into(),
                output.into(),
                "--nopreview".into(),
            ],
            CaptureUtility::Raspistill => vec![
                "-t".into(),
                "1".into(),
                "-w".into(),
                width.into(),
                "-h".into(),
                height.into(),
                "-q".into(),
                quality.into(),
                "-o".into(),
                output.into(),
                "--nopreview".into(),
            ],
            CaptureUtility::Fswebcam => vec![
                "-d".into(),
                device.into(),
                "-r".into(),
                size.into(),
                "--no-banner".into(),
                "--jpeg".into(),
                quality.into(),
                "--save".into(),
                output.into(),
            ],
            CaptureUtility::Ffmpeg => vec![
                "-loglevel".into(),
                "error".into(),
                "-f".into(),
                "v4l2".into(),
                "-i".into(),
                device.into(),
                "-vframes".into(),
                "1".into(),
                "-s".into(),
                size.into(),
                "-y".into(),
                output.into(),
            ],
        };
        args
    }
}

/// Find an executable file called `program` in `search_path`
pub fn locate(program: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    search_path
        .iter()
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Report which utilities are installed, in preference order
pub fn available_utilities(search_path: &[PathBuf]) -> Vec<(CaptureUtility, Option<PathBuf>)> {
    CaptureUtility::ALL
        .iter()
        .map(|utility| (*utility, locate(utility.program(), search_path)))
        .collect()
}

/// `$PATH` split into directories
pub fn system_search_path() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default()
}

/// Opens [`SubprocessSource`]s
#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    timeout: Duration,
    search_path: Option<Vec<PathBuf>>,
    scratch_root: Option<PathBuf>,
}

impl SubprocessBackend {
    /// Backend killing any utility that runs longer than `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            search_path: None,
            scratch_root: None,
        }
    }

    /// Look for utilities in these directories instead of `$PATH`
    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = Some(search_path);
        self
    }

    /// Create scratch directories below `root` instead of the system temp dir
    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = Some(root);
        self
    }

    fn search_path(&self) -> Vec<PathBuf> {
        self.search_path
            .clone()
            .unwrap_or_else(system_search_path)
    }

    fn scratch_dir(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("qscan-");
        match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }
}

impl Default for SubprocessBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CaptureBackend for SubprocessBackend {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn open(
        &self,
        config: &CaptureConfig,
    ) -> std::result::Result<Box<dyn FrameSource>, CaptureFailure> {
        let search_path = self.search_path();
        let installed: Vec<_> = available_utilities(&search_path)
            .into_iter()
            .filter_map(|(utility, path)| path.map(|_| utility.program()))
            .collect();

        if installed.is_empty() {
            return Err(CaptureFailure::DeviceUnavailable(format!(
                "none of {} installed",
                program_list()
            )));
        }

        let scratch = self
            .scratch_dir()
            .map_err(|e| CaptureFailure::OpenFailed(format!("scratch directory: {e}")))?;

        tracing::info!(
            utilities = ?installed,
            scratch = %scratch.path().display(),
            "Still-capture utilities available"
        );

        Ok(Box::new(SubprocessSource {
            config: config.clone(),
            timeout: self.timeout,
            search_path,
            scratch: Some(scratch),
        }))
    }
}

fn program_list() -> String {
    CaptureUtility::ALL
        .iter()
        .map(|u| u.program())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Captures one still per `acquire` through the first utility that works
pub struct SubprocessSource {
    config: CaptureConfig,
    timeout: Duration,
    search_path: Vec<PathBuf>,
    scratch: Option<TempDir>,
}

impl SubprocessSource {
    async fn run_utility(
        &self,
        utility: CaptureUtility,
        program: &Path,
        output: &Path,
    ) -> std::result::Result<(), String> {
        let child = Command::new(program)
            .args(utility.args(&self.config, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawn failed: {e}"))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output_status = match result {
            Err(_) => return Err(format!("timed out after {:?}", self.timeout)),
            Ok(Err(e)) => return Err(format!("wait failed: {e}")),
            Ok(Ok(status)) => status,
        };

        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            return Err(format!(
                "exited with {}: {}",
                output_status.status,
                stderr.trim()
            ));
        }

        if !output.exists() {
            return Err("exited successfully but wrote no image".to_string());
        }

        Ok(())
    }
}

#[async_trait]
impl FrameSource for SubprocessSource {
    async fn acquire(&mut self) -> CaptureResult {
        let scratch_dir = match &self.scratch {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                return Err(CaptureFailure::ReadFailed(
                    "scratch directory already released".to_string(),
                ));
            }
        };

        let mut installed = 0usize;
        let mut errors = Vec::new();

        for utility in CaptureUtility::ALL {
            let Some(program) = locate(utility.program(), &self.search_path) else {
                continue;
            };
            installed += 1;

            let scratch = ScratchFile::new(&scratch_dir, "jpg");
            match self.run_utility(utility, &program, scratch.path()).await {
                Ok(()) => {
                    tracing::debug!(utility = utility.program(), "Still captured");
                    let image = load_still(scratch.path()).await?;
                    return Ok(Frame::new(image));
                }
                Err(reason) => {
                    tracing::debug!(utility = utility.program(), %reason, "Still capture failed");
                    errors.push(format!("{}: {reason}", utility.program()));
                }
            }
        }

        if installed == 0 {
            return Err(CaptureFailure::DeviceUnavailable(format!(
                "none of {} installed",
                program_list()
            )));
        }

        Err(CaptureFailure::ReadFailed(errors.join("; ")))
    }

    fn close(&mut self) {
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                tracing::warn!(path = %path.display(), error = %err, "Failed to remove scratch directory");
            }
        }
    }
}

async fn load_still(path: &Path) -> std::result::Result<image::DynamicImage, CaptureFailure> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CaptureFailure::ReadFailed(format!("{}: {e}", path.display())))?;

    if bytes.is_empty() {
        return Err(CaptureFailure::EmptyFrame);
    }

    image::load_from_memory(&bytes)
        .map_err(|e| CaptureFailure::ReadFailed(format!("{}: {e}", path.display())))
}

/// A scratch file path that is deleted when the guard goes out of scope
pub(crate) struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub(crate) fn new(dir: &Path, extension: &str) -> Self {
        Self {
            path: dir.join(format!("capture-{}.{extension}", Uuid::new_v4())),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "Failed to remove scratch file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_order() {
        let programs: Vec<_> = CaptureUtility::ALL.iter().map(|u| u.program()).collect();
        assert_eq!(
            programs,
            ["libcamera-still", "raspistill", "fswebcam", "ffmpeg"]
        );
    }

    #[test]
    fn test_args_carry_resolution_quality_and_output() {
        let config = CaptureConfig::embedded();
        let output = Path::new("/tmp/out.jpg");

        let args = CaptureUtility::LibcameraStill.args(&config, output);
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|w| w == ["--width", "320"]));
        assert!(args.windows(2).any(|w| w == ["--height", "240"]));
        assert!(args.windows(2).any(|w| w == ["--quality", "75"]));
        assert!(args.windows(2).any(|w| w == ["-o", "/tmp/out.jpg"]));

        let args = CaptureUtility::Ffmpeg.args(&config, output);
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|w| w == ["-i", "/dev/video0"]));
        assert!(args.windows(2).any(|w| w == ["-s", "320x240"]));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.jpg"));
    }

    #[test]
    fn test_scratch_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchFile::new(dir.path(), "jpg");
            std::fs::write(scratch.path(), b"partial").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_scratch_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::new(dir.path(), "jpg");
        drop(scratch);
    }

    #[tokio::test]
    async fn test_open_without_utilities_is_unavailable() {
        let empty = tempfile::tempdir().unwrap();
        let backend = SubprocessBackend::default().with_search_path(vec![empty.path().into()]);
        let result = backend.open(&CaptureConfig::default()).await;
        assert!(matches!(
            result,
            Err(CaptureFailure::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_locate_ignores_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fswebcam"), b"not executable").unwrap();
        assert!(locate("fswebcam", &[dir.path().to_path_buf()]).is_none());
    }
}
