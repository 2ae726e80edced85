//! TIFF export for camera frames.
//!
//! Frames are written as 16-bit grayscale. A stack of frames becomes one
//! multi-page file, one page per frame in acquisition order.

use crate::devices::frame::Frame;
use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tiff::encoder::{colortype, TiffEncoder};

/// TIFF export functionality for camera frames.
pub struct TiffWriter;

impl TiffWriter {
    /// Write a stack of equally sized frames into one multi-page file.
    pub fn write_stack<P: AsRef<Path>>(frames: &[Frame], path: P) -> Result<PathBuf> {
        let first = frames
            .first()
            .ok_or_else(|| anyhow!("Cannot write empty frame stack"))?;
        let path = path.as_ref();

        for (i, frame) in frames.iter().enumerate() {
            if frame.shape() != first.shape() {
                return Err(anyhow!(
                    "Frame {} has inconsistent dimensions: {}x{} vs expected {}x{}",
                    i,
                    frame.width,
                    frame.height,
                    first.width,
                    first.height
                ));
            }
        }

        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file))
            .with_context(|| format!("Failed to start TIFF stack {:?}", path))?;
        for (i, frame) in frames.iter().enumerate() {
            let page = encoder
                .new_image::<colortype::Gray16>(frame.width, frame.height)
                .with_context(|| format!("Failed to add page {} to {:?}", i, path))?;
            page.write_data(&frame.pixels)
                .with_context(|| format!("Failed to write page {} to {:?}", i, path))?;
        }

        tracing::info!(
            path = ?path,
            num_frames = frames.len(),
            dimensions = format!("{}x{}", first.width, first.height),
            "Wrote TIFF stack"
        );
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tiff::decoder::{Decoder, DecodingResult};

    fn gradient(width: u32, height: u32) -> Frame {
        let n = width * height;
        let pixels = (0..n).map(|i| ((i as f32 / n as f32) * 65535.0) as u16).collect();
        Frame::new(width, height, pixels).unwrap()
    }

    #[test]
    fn test_write_stack_is_one_multi_page_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("BIDE_R1A0A4S-5.0_.tiff");
        let mut frames = vec![gradient(8, 8), gradient(8, 8), gradient(8, 8)];
        frames[1].pixels[0] = 1234;
        let written = TiffWriter::write_stack(&frames, &path).unwrap();
        assert_eq!(written, path);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        let mut pages = Vec::new();
        loop {
            assert_eq!(decoder.dimensions().unwrap(), (8, 8));
            match decoder.read_image().unwrap() {
                DecodingResult::U16(pixels) => pages.push(pixels),
                _ => panic!("expected 16-bit pages"),
            }
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().unwrap();
        }
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1][0], 1234);
        assert_eq!(pages[2], frames[2].pixels);
    }

    #[test]
    fn test_stack_rejects_mixed_sizes() {
        let temp_dir = TempDir::new().unwrap();
        let frames = vec![gradient(8, 8), gradient(4, 8)];
        assert!(TiffWriter::write_stack(&frames, temp_dir.path().join("x.tiff")).is_err());
        assert!(TiffWriter::write_stack(&[], temp_dir.path().join("y.tiff")).is_err());
    }
}
