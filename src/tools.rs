use crate::paths::AppPaths;
use crate::{Result, VaultError};
use serde::Serialize;
use std::ffi::OsStr;
use std::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct FfmpegStatus {
    pub installed: bool,
    pub ffmpeg_path: String,
    pub ffmpeg_version: Option<String>,
}

/// ffmpeg is the only external tool this system runs. `installed` refers to
/// the managed copy under the tools dir; a PATH ffmpeg still shows up in
/// `ffmpeg_version`.
pub fn ffmpeg_status(paths: &AppPaths) -> FfmpegStatus {
    let ffmpeg_path = paths.ffmpeg_bin_path();
    FfmpegStatus {
        installed: ffmpeg_path.exists(),
        ffmpeg_path: ffmpeg_path.to_string_lossy().to_string(),
        ffmpeg_version: tool_version_first_line(paths.ffmpeg_cmd()),
    }
}

/// Download and unpack a static ffmpeg build into the tools dir for setups
/// without a system ffmpeg.
pub fn install_ffmpeg(paths: &AppPaths) -> Result<FfmpegStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    std::fs::create_dir_all(&destination)?;

    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| VaultError::InstallFailed(e.to_string()))?;
    let archive_path = ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
        .map_err(|e| VaultError::InstallFailed(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| VaultError::InstallFailed(e.to_string()))?;

    Ok(ffmpeg_status(paths))
}

fn tool_version_first_line(program: impl AsRef<OsStr>) -> Option<String> {
    let output = Command::new(program).arg("-version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_missing_managed_install() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let status = ffmpeg_status(&paths);
        assert!(!status.installed);
        assert!(status.ffmpeg_path.contains("ffmpeg"));
    }
}
