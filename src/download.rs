use crate::feed::build_http_agent;
use crate::paths::AppPaths;
use crate::store::{self, DownloadStatus, VideoRecord};
use crate::{Result, VaultError};
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

const COVER_FETCH_TIMEOUT_SECS: u64 = 60;

fn background_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Keep tool invocations from popping console windows.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// Pull an HLS manifest through ffmpeg and remux it into the output file.
/// Stream parsing, segment fetching and merging are entirely ffmpeg's
/// problem; this call blocks until it finishes.
pub fn mux_stream(paths: &AppPaths, stream_url: &str, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = background_command(paths.ffmpeg_cmd())
        .args(["-nostdin", "-y"])
        .args(["-i", stream_url])
        .args(["-c", "copy"])
        .args(["-bsf:a", "aac_adtstoasc"])
        .arg(output)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VaultError::ExternalToolMissing {
                tool: "ffmpeg".to_string(),
            },
            _ => VaultError::Io(e),
        })?;

    if !result.status.success() {
        return Err(VaultError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: result.status.code(),
            stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Fetch a cover image next to the video: streamed to a `.part` file and
/// renamed only on success so an interrupted fetch leaves nothing behind.
pub fn fetch_cover(cover_url: &str, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let agent = build_http_agent(COVER_FETCH_TIMEOUT_SECS);
    let mut response = agent
        .get(cover_url)
        .call()
        .map_err(|e| VaultError::Http(format!("cover request failed: {e}")))?;

    let status = response.status().as_u16();
    if status >= 400 {
        return Err(VaultError::Http(format!("cover returned http {status}")));
    }

    let temp_path = output.with_extension("part");
    let _ = std::fs::remove_file(&temp_path);

    let mut file = std::fs::File::create(&temp_path)?;
    let mut reader = response.body_mut().as_reader();
    let mut buf = [0u8; 64 * 1024];
    let mut written: u64 = 0;
    loop {
        let read = reader.read(&mut buf).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            VaultError::Http(format!("failed reading cover body: {e}"))
        })?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])?;
        written += read as u64;
    }
    file.flush()?;
    drop(file);

    if written == 0 {
        let _ = std::fs::remove_file(&temp_path);
        return Err(VaultError::Http("cover response was empty".to_string()));
    }

    if output.exists() {
        let _ = std::fs::remove_file(output);
    }
    std::fs::rename(&temp_path, output)?;
    Ok(())
}

/// Replace characters that are unsafe in file names; collapses everything
/// outside a conservative allowlist to `_` and bounds the length.
pub fn sanitize_file_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_alphanumeric() || ch == '-' || ch == '_' || ch == '.' || ch == ' ' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let mut trimmed = out.trim_matches(|ch: char| ch == '_' || ch == '.' || ch == ' ').to_string();
    if trimmed.len() > 120 {
        let mut cut = 120;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        trimmed.truncate(cut);
    }
    if trimmed.is_empty() {
        trimmed.push_str("video");
    }
    trimmed
}

/// Best-effort locate of a just-produced output file. The contract is
/// narrow on purpose: an identity key embedded in the file name wins over a
/// title substring, both matched case-insensitively against video files
/// under `download_dir`.
pub fn locate_output(download_dir: &Path, identity_key: &str, title: &str) -> Option<PathBuf> {
    let mut candidates: Vec<(PathBuf, String)> = Vec::new();
    for entry in WalkDir::new(download_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_video = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| crate::reconcile::VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_video {
            continue;
        }
        let name_lower = entry.file_name().to_string_lossy().to_lowercase();
        candidates.push((entry.path().to_path_buf(), name_lower));
    }

    let key_needle = identity_key.trim().to_lowercase();
    if !key_needle.is_empty() {
        if let Some((path, _)) = candidates.iter().find(|(_, name)| name.contains(&key_needle)) {
            return Some(path.clone());
        }
    }

    let title_needle = sanitize_file_name(title).to_lowercase();
    if title_needle.len() >= 2 {
        if let Some((path, _)) = candidates
            .iter()
            .find(|(_, name)| name.contains(&title_needle))
        {
            return Some(path.clone());
        }
    }

    None
}

/// Run one record through the media collaborator:
/// Pending -> Downloading -> Completed/Failed. There is no internal retry;
/// a failed record waits for the user to re-triage it.
pub fn download_video(paths: &AppPaths, record: &VideoRecord) -> bool {
    let key = record.identity_key.as_str();

    if record.is_paid() {
        info!(identity_key = %key, "record is access-restricted, skipping download");
        return false;
    }
    let stream_url = match record.source_url.as_deref() {
        Some(url) => url,
        None => return false,
    };

    let download_dir = match paths.effective_download_dir() {
        Ok(dir) => dir,
        Err(e) => {
            warn!(identity_key = %key, error = %e, "cannot resolve download directory");
            return false;
        }
    };

    if let Err(e) = store::update_status(paths, key, DownloadStatus::Downloading, None, None) {
        warn!(identity_key = %key, error = %e, "failed to mark record downloading");
    }

    let base_name = if record.date_token == crate::extract::UNKNOWN_DATE_TOKEN {
        sanitize_file_name(&record.title)
    } else {
        format!("{}_{}", sanitize_file_name(&record.title), record.date_token)
    };
    let output = download_dir.join(format!("{base_name}.mp4"));

    match mux_stream(paths, stream_url, &output) {
        Ok(()) => {}
        Err(e) => {
            warn!(identity_key = %key, error = %e, "stream download failed");
            // A partial output would otherwise be adopted as a finished
            // download by the next reconciliation.
            let _ = std::fs::remove_file(&output);
            mark_failed(paths, key, &e.to_string());
            return false;
        }
    }

    // ffmpeg reported success; confirm an output file actually exists. The
    // expected path is checked first, then the locate heuristic.
    let located = if output.exists() {
        Some(output.clone())
    } else {
        locate_output(&download_dir, key, &record.title)
    };

    let final_path = match located {
        Some(path) => path,
        None => {
            warn!(identity_key = %key, "download reported success but no output file was found");
            mark_failed(paths, key, "no output file after reported success");
            return false;
        }
    };

    let file_size = std::fs::metadata(&final_path).map(|m| m.len() as i64).ok();
    let final_path_str = final_path.to_string_lossy().to_string();
    if let Err(e) = store::update_status(
        paths,
        key,
        DownloadStatus::Completed,
        Some(&final_path_str),
        file_size,
    ) {
        warn!(identity_key = %key, error = %e, "failed to mark record completed");
        return false;
    }
    store::record_history(paths, key, "download", "completed", None, None);
    info!(identity_key = %key, path = %final_path_str, "download completed");

    if let Some(cover_url) = record.cover_url.as_deref() {
        let cover_path = final_path.with_extension("jpg");
        if let Err(e) = fetch_cover(cover_url, &cover_path) {
            warn!(identity_key = %key, error = %e, "cover fetch failed");
        }
    }

    true
}

fn mark_failed(paths: &AppPaths, key: &str, reason: &str) {
    if let Err(e) = store::update_status(paths, key, DownloadStatus::Failed, None, None) {
        warn!(identity_key = %key, error = %e, "failed to mark record failed");
    }
    store::record_history(paths, key, "download", "failed", Some(reason), None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_file_name("Backstage 0714"), "Backstage 0714");
        assert_eq!(sanitize_file_name("a/b\\c:d*e"), "a_b_c_d_e");
        assert_eq!(sanitize_file_name("___"), "video");
        assert_eq!(sanitize_file_name(""), "video");
    }

    #[test]
    fn sanitize_bounds_length_on_char_boundaries() {
        let long = "日".repeat(200);
        let out = sanitize_file_name(&long);
        assert!(out.len() <= 120);
        assert!(!out.is_empty());
    }

    #[test]
    fn locate_prefers_key_over_title() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("shared title.mp4"), b"a").expect("write");
        std::fs::write(dir.path().join("shared title K55.mp4"), b"b").expect("write");

        let hit = locate_output(dir.path(), "K55", "shared title").expect("match");
        assert!(hit
            .file_name()
            .expect("name")
            .to_string_lossy()
            .contains("K55"));
    }

    #[test]
    fn locate_falls_back_to_title_substring() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("My Clip_0714.mp4"), b"a").expect("write");

        let hit = locate_output(dir.path(), "absent-key", "my clip");
        assert!(hit.is_some());
    }

    #[test]
    fn locate_ignores_non_video_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("K55.jpg"), b"a").expect("write");

        assert!(locate_output(dir.path(), "K55", "anything").is_none());
    }
}
