//! MP4/MOV poster-frame decoding.
//!
//! The container is probed in-process with the `mp4` crate for its video
//! track, dimensions and duration. The frame itself comes from `ffmpeg`,
//! which also applies the track's display matrix so the frame is already
//! upright. ffmpeg runs under the invocation's remaining time budget and is
//! killed if it overruns.

use super::{DecodeError, DecodedImage, Decoder};
use crate::budget::Budget;
use crate::format::MediaFormat;
use image::ImageFormat;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Poster frames are taken at most this far in, to skip fade-ins.
const MAX_SEEK: Duration = Duration::from_secs(1);

pub struct VideoDecoder {
    ffmpeg: PathBuf,
}

impl Default for VideoDecoder {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

/// What the container says about its first video track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub duration: Duration,
}

impl VideoDecoder {
    pub fn with_ffmpeg(path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: path.into(),
        }
    }

    fn extract_frame(&self, bytes: &[u8], seek: Duration, budget: &Budget) -> Result<Vec<u8>, DecodeError> {
        // ffmpeg needs to seek to the `moov` box, which a pipe cannot do.
        let mut input = tempfile::Builder::new()
            .prefix("rendition-src-")
            .tempfile()
            .map_err(|e| DecodeError::ResourceExhausted(format!("temporary file: {e}")))?;
        input
            .write_all(bytes)
            .map_err(|e| DecodeError::ResourceExhausted(format!("temporary file: {e}")))?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-nostdin", "-v", "error", "-ss"])
            .arg(format!("{:.3}", seek.as_secs_f64()))
            .arg("-i")
            .arg(input.path())
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::debug!("poster frame: {:?} {:?}", self.ffmpeg, cmd.get_args().collect::<Vec<_>>());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DecodeError::Unsupported(format!(
                    "video decoding requires ffmpeg ({} not found)",
                    self.ffmpeg.display()
                ))
            } else {
                DecodeError::ResourceExhausted(format!("failed to start ffmpeg: {e}"))
            }
        })?;

        let stdout = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                out.read_to_end(&mut buf).map(|_| buf)
            })
        });
        let stderr = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let status = match child.wait_timeout(budget.remaining()) {
            Ok(Some(status)) => status,
            Ok(None) => {
                reap(&mut child);
                return Err(DecodeError::ResourceExhausted(
                    "ffmpeg ran past the time budget and was killed".into(),
                ));
            }
            Err(e) => {
                reap(&mut child);
                return Err(DecodeError::ResourceExhausted(format!("waiting for ffmpeg: {e}")));
            }
        };

        let frame = stdout
            .and_then(|h| h.join().ok())
            .and_then(|r| r.ok())
            .unwrap_or_default();
        let diagnostics = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if !status.success() {
            let detail = diagnostics.lines().last().unwrap_or("no diagnostics").to_string();
            return Err(DecodeError::Corrupt(format!("ffmpeg could not read the video: {detail}")));
        }
        if frame.is_empty() {
            return Err(DecodeError::Corrupt("video has no decodable frames".into()));
        }
        Ok(frame)
    }
}

impl Decoder for VideoDecoder {
    fn name(&self) -> &'static str {
        "video"
    }

    fn supports(&self, format: MediaFormat) -> bool {
        matches!(format, MediaFormat::Mp4 | MediaFormat::Mov)
    }

    fn decode(&self, bytes: &[u8], budget: &Budget) -> Result<DecodedImage, DecodeError> {
        let seek = match probe(bytes) {
            Ok(info) => {
                log::debug!(
                    "video track {}x{}, {:.1}s",
                    info.width,
                    info.height,
                    info.duration.as_secs_f64()
                );
                budget.check_canvas(info.width, info.height, 4)?;
                poster_time(info.duration)
            }
            // QuickTime atoms the mp4 crate does not model; ffmpeg decides.
            Err(e) if is_quicktime(bytes) => {
                log::debug!("MOV probe skipped: {e}");
                Duration::ZERO
            }
            Err(e) => return Err(e),
        };

        let png = self.extract_frame(bytes, seek, budget)?;
        let canvas = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .map_err(|e| DecodeError::Corrupt(format!("ffmpeg frame: {e}")))?;
        budget.check_time("video frame")?;
        Ok(DecodedImage::new(canvas))
    }
}

/// Kill `child` and collect its exit status so no zombie is left behind.
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("killing ffmpeg: {e}");
    }
    if let Err(e) = child.wait() {
        log::warn!("reaping ffmpeg: {e}");
    }
}

/// Read the first video track's geometry and the movie duration.
pub fn probe(bytes: &[u8]) -> Result<VideoProbe, DecodeError> {
    let reader = mp4::Mp4Reader::read_header(Cursor::new(bytes), bytes.len() as u64)
        .map_err(|e| DecodeError::Corrupt(format!("video container: {e}")))?;
    let track = reader
        .tracks()
        .values()
        .find(|t| matches!(t.track_type(), Ok(mp4::TrackType::Video)))
        .ok_or_else(|| DecodeError::Corrupt("video container has no video track".into()))?;
    Ok(VideoProbe {
        width: u32::from(track.width()),
        height: u32::from(track.height()),
        duration: reader.duration(),
    })
}

/// min(1s, duration / 2); zero for unknown durations.
fn poster_time(duration: Duration) -> Duration {
    (duration / 2).min(MAX_SEEK)
}

fn is_quicktime(bytes: &[u8]) -> bool {
    matches!(crate::format::detect(bytes, None), Ok(MediaFormat::Mov))
}
