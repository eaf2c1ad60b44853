//! Raster access behind the atlas pipeline.
//!
//! Compositing needs three capabilities: measuring source images, loading
//! existing atlas pages, and creating blank ones. They sit behind
//! [`AtlasCodec`] so the pipeline and its tests can run against an
//! in-memory fake while the CLI wires in [`PngCodec`].

use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use image::{ImageFormat, RgbaImage};

/// Opens and measures raster files for the atlas pipeline.
pub trait AtlasCodec {
    /// Reads the pixel dimensions of `source` without decoding the full
    /// image.
    fn dimensions(&self, source: &Path) -> anyhow::Result<(u32, u32)>;

    /// Loads an existing atlas page from disk.
    fn open_page(&self, path: &Path) -> anyhow::Result<Box<dyn AtlasPage>>;

    /// Creates a blank, fully transparent page.
    fn create_page(&self, width: u32, height: u32) -> anyhow::Result<Box<dyn AtlasPage>>;
}

/// One mutable atlas page.
pub trait AtlasPage {
    /// Pastes the image at `source` onto the page with its top-left corner
    /// at `(x, y)`. `width` and `height` are the dimensions the region
    /// table promised; a source that disagrees is pasted anyway at its own
    /// size.
    fn composite(
        &mut self,
        source: &Path,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()>;

    /// Writes the page back to disk.
    fn export(&self, path: &Path) -> anyhow::Result<()>;
}

/// The on-disk codec: pages and sources are PNG-encoded RGBA.
pub struct PngCodec;

impl AtlasCodec for PngCodec {
    fn dimensions(&self, source: &Path) -> anyhow::Result<(u32, u32)> {
        let contents = fs_err::read(source)?;
        let reader = image::ImageReader::new(Cursor::new(contents))
            .with_guessed_format()
            .with_context(|| format!("could not detect the image format of {}", source.display()))?;

        reader
            .into_dimensions()
            .with_context(|| format!("could not measure {}", source.display()))
    }

    fn open_page(&self, path: &Path) -> anyhow::Result<Box<dyn AtlasPage>> {
        let contents = fs_err::read(path)?;
        let pixels = image::load_from_memory(&contents)
            .with_context(|| format!("could not decode atlas page {}", path.display()))?
            .to_rgba8();

        Ok(Box::new(PngPage { pixels }))
    }

    fn create_page(&self, width: u32, height: u32) -> anyhow::Result<Box<dyn AtlasPage>> {
        Ok(Box::new(PngPage {
            pixels: RgbaImage::new(width, height),
        }))
    }
}

struct PngPage {
    pixels: RgbaImage,
}

impl AtlasPage for PngPage {
    fn composite(
        &mut self,
        source: &Path,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        let contents = fs_err::read(source)?;
        let overlay = image::load_from_memory(&contents)
            .with_context(|| format!("could not decode {}", source.display()))?
            .to_rgba8();

        if overlay.dimensions() != (width, height) {
            log::warn!(
                "{} is {}x{} but its region was declared {}x{}",
                source.display(),
                overlay.width(),
                overlay.height(),
                width,
                height,
            );
        }

        image::imageops::replace(&mut self.pixels, &overlay, i64::from(x), i64::from(y));
        Ok(())
    }

    fn export(&self, path: &Path) -> anyhow::Result<()> {
        let mut encoded = Cursor::new(Vec::new());
        self.pixels
            .write_to(&mut encoded, ImageFormat::Png)
            .with_context(|| format!("could not encode atlas page {}", path.display()))?;

        fs_err::write(path, encoded.into_inner())?;
        Ok(())
    }
}
