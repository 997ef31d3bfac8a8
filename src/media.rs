//! Ranged media streaming (§4.K). Preparing a stream (path containment,
//! range math, DLNA header composition) happens on the async side;
//! the actual byte transfer is hot enough that it is handed to a real
//! OS thread doing blocking `sendfile(2)`, with a read/write fallback
//! when the kernel can't do zero-copy for this file (network filesystem,
//! `EOVERFLOW`, unsupported fd type).

use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::dirlist::{self, ListError};
use crate::http::request::TransferMode;
use crate::util::mime::{mime_lookup, MimeClass};

const MAX_BUFFER_SIZE: usize = i32::MAX as usize;
const MIN_BUFFER_SIZE: usize = 65536;
const FALLBACK_CHUNK: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("not found")]
    NotFound,
    #[error("path escapes media root")]
    Containment,
    #[error("not a file")]
    NotAFile,
    #[error("unrecognised media type")]
    UnknownType,
    #[error("malformed range")]
    BadRange,
    #[error("range not satisfiable")]
    RangeNotSatisfiable,
}

/// Resolves `relative` to a regular file under `media_root` and returns
/// its size and MIME classification.
pub fn resolve_media_file(
    media_root: &Path,
    relative: &str,
) -> Result<(PathBuf, u64, MimeClass, &'static str), StreamError> {
    let resolved = match dirlist::resolve_contained(media_root, relative) {
        Ok(p) => p,
        Err(ListError::Containment) => return Err(StreamError::Containment),
        Err(_) => return Err(StreamError::NotFound),
    };
    let meta = std::fs::metadata(&resolved).map_err(|_| StreamError::NotFound)?;
    if !meta.is_file() {
        return Err(StreamError::NotAFile);
    }
    let name = resolved.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let (class, sub) = mime_lookup(name).ok_or(StreamError::UnknownType)?;
    Ok((resolved, meta.len(), class, sub))
}

/// Transfer-mode sanity checks (§4.K): returns the status to send in
/// place of the stream when the combination is disallowed.
pub fn transfer_mode_check(mode: Option<TransferMode>, class: MimeClass, real_time_info: bool) -> Option<u16> {
    match mode {
        Some(TransferMode::Streaming) if class == MimeClass::Image => Some(406),
        Some(TransferMode::Interactive) if real_time_info => Some(400),
        Some(TransferMode::Interactive) if class != MimeClass::Image => Some(406),
        _ => None,
    }
}

/// Resolves a `Range` request against `size`, returning an inclusive
/// `(start, end)` byte span. `None, None` means no Range header was
/// present (the whole file, as a 200).
pub fn resolve_range(size: u64, start: Option<u64>, end: Option<u64>) -> Result<(u64, u64), StreamError> {
    if size == 0 {
        return Err(StreamError::RangeNotSatisfiable);
    }
    match (start, end) {
        (None, None) => Ok((0, size - 1)),
        (None, Some(suffix)) => {
            if suffix == 0 {
                return Err(StreamError::RangeNotSatisfiable);
            }
            let start = size.saturating_sub(suffix);
            Ok((start, size - 1))
        }
        (Some(start), end) => {
            if start >= size {
                return Err(StreamError::BadRange);
            }
            let raw_end = end.unwrap_or(size - 1);
            if raw_end < start {
                return Err(StreamError::BadRange);
            }
            Ok((start, raw_end.min(size - 1)))
        }
    }
}

/// `DLNA.ORG_FLAGS` bitmask: sender-paced + tm.s + tm.b always set,
/// plus tm.i for everything but images (background transfer for a
/// still image makes no sense).
fn dlna_flags(class: MimeClass) -> u32 {
    const TIME_BASED_SEEK: u32 = 0x0010_0000;
    const BYTE_BASED_SEEK: u32 = 0x0020_0000;
    const PLAY_CONTAINER: u32 = 0x0040_0000;
    const BACKGROUND_TM: u32 = 0x0080_0000;
    const INTERACTIVE_TM: u32 = 0x0100_0000;
    let base = TIME_BASED_SEEK | BYTE_BASED_SEEK | PLAY_CONTAINER;
    base | if class == MimeClass::Image { BACKGROUND_TM } else { INTERACTIVE_TM }
}

fn content_features_header(class: MimeClass) -> String {
    format!("DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS={:08X}{}", dlna_flags(class), "0".repeat(24))
}

/// Looks for a `.srt` sibling: the original extension is replaced within
/// the last 7 characters of the filename, same as the MIME lookup's
/// window.
pub fn find_caption_sibling(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let floor = name.len().saturating_sub(7);
    let dot = (floor..name.len()).rev().find(|&i| name.as_bytes()[i] == b'.')?;
    let candidate_name = format!("{}.srt", &name[..dot]);
    let candidate = path.with_file_name(candidate_name);
    std::fs::metadata(&candidate).ok().filter(|m| m.is_file()).map(|_| candidate)
}

pub struct PreparedStream {
    pub status_line: &'static str,
    pub content_type: String,
    pub content_length: u64,
    pub content_range: Option<String>,
    pub content_features: String,
    pub caption_url: Option<String>,
    pub file_path: PathBuf,
    pub start: u64,
    pub end: u64,
    pub head_only: bool,
}

pub enum MediaOutcome {
    Stream(PreparedStream),
    Status(u16),
}

pub struct MediaRequestArgs<'a> {
    pub relative: &'a str,
    pub head_only: bool,
    pub range_start: Option<u64>,
    pub range_end: Option<u64>,
    pub transfer_mode: Option<TransferMode>,
    pub real_time_info: bool,
    pub caption_requested: bool,
    pub host: &'a str,
}

pub fn prepare(media_root: &Path, args: &MediaRequestArgs) -> MediaOutcome {
    let (path, size, class, sub) = match resolve_media_file(media_root, args.relative) {
        Ok(v) => v,
        Err(StreamError::Containment) => return MediaOutcome::Status(406),
        Err(StreamError::NotAFile) => return MediaOutcome::Status(403),
        Err(StreamError::UnknownType) => return MediaOutcome::Status(406),
        Err(_) => return MediaOutcome::Status(404),
    };

    if let Some(status) = transfer_mode_check(args.transfer_mode, class, args.real_time_info) {
        return MediaOutcome::Status(status);
    }

    let had_range = args.range_start.is_some() || args.range_end.is_some();
    let (start, end) = match resolve_range(size, args.range_start, args.range_end) {
        Ok(v) => v,
        Err(StreamError::BadRange) => return MediaOutcome::Status(400),
        Err(_) => return MediaOutcome::Status(416),
    };

    let caption_url = if args.caption_requested {
        find_caption_sibling(&path).map(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let parent_rel = Path::new(args.relative).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
            let rel = if parent_rel.is_empty() { name.to_string() } else { format!("{parent_rel}/{name}") };
            format!("http://{}/MediaItems/{}", args.host, crate::util::path::url_escape(&rel))
        })
    } else {
        None
    };

    MediaOutcome::Stream(PreparedStream {
        status_line: if had_range { "206 Partial Content" } else { "200 OK" },
        content_type: format!("{}/{}", class.as_str(), sub),
        content_length: end - start + 1,
        content_range: if had_range { Some(format!("bytes {start}-{end}/{size}")) } else { None },
        content_features: content_features_header(class),
        caption_url,
        file_path: path,
        start,
        end,
        head_only: args.head_only,
    })
}

impl PreparedStream {
    pub fn header_block(&self) -> String {
        let mut h = format!(
            "HTTP/1.1 {status}\r\n\
             Connection: close\r\n\
             Content-Type: {ctype}\r\n\
             Content-Length: {clen}\r\n\
             Accept-Ranges: bytes\r\n\
             contentFeatures.dlna.org: {features}\r\n",
            status = self.status_line,
            ctype = self.content_type,
            clen = self.content_length,
            features = self.content_features,
        );
        if let Some(range) = &self.content_range {
            h.push_str(&format!("Content-Range: {range}\r\n"));
        }
        if let Some(cap) = &self.caption_url {
            h.push_str(&format!("CaptionInfo.sec: {cap}\r\n"));
        }
        h.push_str("\r\n");
        h
    }
}

/// Runs on a dedicated OS thread: writes the header block then transfers
/// `[start, end]` of `file_path` over `stream` via `sendfile(2)`, falling
/// back to a buffered read/write loop when the kernel can't do it.
pub fn run_transfer(mut stream: StdTcpStream, prepared: &PreparedStream) {
    if let Err(e) = stream.write_all(prepared.header_block().as_bytes()) {
        debug!("failed writing media response header: {e}");
        return;
    }
    if prepared.head_only {
        return;
    }

    let file = match File::open(&prepared.file_path) {
        Ok(f) => f,
        Err(e) => {
            debug!("failed to open media file for streaming: {e}");
            return;
        }
    };

    let mut remaining = prepared.content_length;
    let mut offset = prepared.start as libc::off_t;
    let out_fd = stream.as_raw_fd();
    let in_fd = file.as_raw_fd();
    let mut use_sendfile = true;

    while remaining > 0 {
        if use_sendfile {
            let want = remaining.min(MAX_BUFFER_SIZE as u64).max(MIN_BUFFER_SIZE as u64).min(remaining) as usize;
            let sent = unsafe { libc::sendfile(out_fd, in_fd, &mut offset, want) };
            if sent >= 0 {
                remaining -= sent as u64;
                if sent == 0 {
                    break;
                }
                continue;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => continue,
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                    debug!("client disconnected mid-stream");
                    return;
                }
                Some(libc::EOVERFLOW) | Some(libc::EINVAL) => {
                    warn!("sendfile unsupported for this file, falling back to read/write");
                    use_sendfile = false;
                    continue;
                }
                _ => {
                    debug!("sendfile failed: {err}");
                    return;
                }
            }
        } else {
            let mut file = &file;
            if let Err(e) = std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(offset as u64)) {
                debug!("seek failed during streaming fallback: {e}");
                return;
            }
            let want = remaining.min(FALLBACK_CHUNK as u64) as usize;
            let mut buf = vec![0u8; want];
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("read failed during streaming fallback: {e}");
                    return;
                }
            };
            if let Err(e) = stream.write_all(&buf[..n]) {
                debug!("write failed during streaming fallback: {e}");
                return;
            }
            offset += n as libc::off_t;
            remaining -= n as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_defaults_to_full_file() {
        assert_eq!(resolve_range(100, None, None).unwrap(), (0, 99));
    }

    #[test]
    fn suffix_range_is_tail_of_file() {
        assert_eq!(resolve_range(100, None, Some(10)).unwrap(), (90, 99));
    }

    #[test]
    fn start_beyond_size_is_bad_range() {
        assert!(matches!(resolve_range(100, Some(200), None), Err(StreamError::BadRange)));
    }

    #[test]
    fn start_after_end_is_bad_range() {
        assert!(matches!(resolve_range(100, Some(50), Some(10)), Err(StreamError::BadRange)));
    }

    #[test]
    fn end_clamped_to_size() {
        assert_eq!(resolve_range(100, Some(50), Some(1000)).unwrap(), (50, 99));
    }

    #[test]
    fn streaming_image_is_rejected() {
        assert_eq!(transfer_mode_check(Some(TransferMode::Streaming), MimeClass::Image, false), Some(406));
    }

    #[test]
    fn interactive_with_realtimeinfo_is_400() {
        assert_eq!(transfer_mode_check(Some(TransferMode::Interactive), MimeClass::Video, true), Some(400));
    }

    #[test]
    fn interactive_non_image_is_406() {
        assert_eq!(transfer_mode_check(Some(TransferMode::Interactive), MimeClass::Video, false), Some(406));
    }

    #[test]
    fn background_any_type_is_allowed() {
        assert_eq!(transfer_mode_check(Some(TransferMode::Background), MimeClass::Video, false), None);
    }

    #[test]
    fn containment_violation_is_406() {
        let dir = tempfile::tempdir().unwrap();
        let args = MediaRequestArgs {
            relative: "../etc/passwd",
            head_only: false,
            range_start: None,
            range_end: None,
            transfer_mode: None,
            real_time_info: false,
            caption_requested: false,
            host: "h",
        };
        assert!(matches!(prepare(dir.path(), &args), MediaOutcome::Status(406)));
    }

    #[test]
    fn non_regular_file_is_403() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub.mp4")).unwrap();
        let args = MediaRequestArgs {
            relative: "sub.mp4",
            head_only: false,
            range_start: None,
            range_end: None,
            transfer_mode: None,
            real_time_info: false,
            caption_requested: false,
            host: "h",
        };
        assert!(matches!(prepare(dir.path(), &args), MediaOutcome::Status(403)));
    }

    #[test]
    fn unrecognised_extension_is_406() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.xyz"), b"x").unwrap();
        let args = MediaRequestArgs {
            relative: "notes.xyz",
            head_only: false,
            range_start: None,
            range_end: None,
            transfer_mode: None,
            real_time_info: false,
            caption_requested: false,
            host: "h",
        };
        assert!(matches!(prepare(dir.path(), &args), MediaOutcome::Status(406)));
    }

    #[test]
    fn malformed_range_is_400() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), vec![0u8; 10]).unwrap();
        let args = MediaRequestArgs {
            relative: "clip.mp4",
            head_only: false,
            range_start: Some(50),
            range_end: None,
            transfer_mode: None,
            real_time_info: false,
            caption_requested: false,
            host: "h",
        };
        assert!(matches!(prepare(dir.path(), &args), MediaOutcome::Status(400)));
    }

    #[test]
    fn caption_sibling_found_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("clip.srt"), b"1\n00:00:00").unwrap();
        let found = find_caption_sibling(&dir.path().join("clip.mp4"));
        assert_eq!(found, Some(dir.path().join("clip.srt")));
    }

    #[test]
    fn caption_sibling_absent_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
        assert_eq!(find_caption_sibling(&dir.path().join("clip.mp4")), None);
    }
}
