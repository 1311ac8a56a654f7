//! Local display mirroring sinks

use crate::format::{to_rgb888, FormatError, FrameGeometry};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("frame conversion failed: {0}")]
    Format(#[from] FormatError),

    #[error("display not set up")]
    NotReady,
}

/// Receives every captured frame for local rendering. Purely a sink: it gives
/// no feedback to the capture loop beyond an error to log.
pub trait DisplaySink: Send {
    fn name(&self) -> &str;

    /// Called once with the negotiated geometry before the first frame
    fn setup(&mut self, geometry: &FrameGeometry) -> Result<(), DisplayError>;

    fn write(&mut self, frame: &[u8], geometry: &FrameGeometry) -> Result<(), DisplayError>;
}

/// Discards frames
#[derive(Debug, Default)]
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn name(&self) -> &str {
        "none"
    }

    fn setup(&mut self, _geometry: &FrameGeometry) -> Result<(), DisplayError> {
        Ok(())
    }

    fn write(&mut self, _frame: &[u8], _geometry: &FrameGeometry) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Writes every n-th frame to a PPM file, replacing the previous snapshot
pub struct SnapshotDisplay {
    path: PathBuf,
    every_n_frames: u64,
    frames: u64,
    rgb: Vec<u8>,
}

impl SnapshotDisplay {
    pub fn new(path: impl Into<PathBuf>, every_n_frames: u64) -> Self {
        Self {
            path: path.into(),
            every_n_frames: every_n_frames.max(1),
            frames: 0,
            rgb: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DisplaySink for SnapshotDisplay {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn setup(&mut self, geometry: &FrameGeometry) -> Result<(), DisplayError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.rgb = vec![0u8; geometry.width as usize * geometry.height as usize * 3];
        info!(path = %self.path.display(), every = self.every_n_frames, "Snapshot display ready");
        Ok(())
    }

    fn write(&mut self, frame: &[u8], geometry: &FrameGeometry) -> Result<(), DisplayError> {
        let frame_no = self.frames;
        self.frames += 1;
        if frame_no % self.every_n_frames != 0 {
            return Ok(());
        }
        if self.rgb.is_empty() {
            return Err(DisplayError::NotReady);
        }

        to_rgb888(geometry, frame, &mut self.rgb)?;

        // Write next to the target and rename so readers never see a torn file
        let tmp = self.path.with_extension("ppm.tmp");
        {
            let mut file = io::BufWriter::new(fs::File::create(&tmp)?);
            write_ppm(&mut file, geometry.width, geometry.height, &self.rgb)?;
            file.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(frame = frame_no, path = %self.path.display(), "Snapshot written");
        Ok(())
    }
}

/// Writes packed RGB888 pixels as a binary PPM (P6) image
pub fn write_ppm<W: Write>(out: &mut W, width: u32, height: u32, rgb: &[u8]) -> io::Result<()> {
    write!(out, "P6\n{} {}\n255\n", width, height)?;
    out.write_all(rgb)
}
