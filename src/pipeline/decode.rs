use std::{convert::TryFrom, io::Cursor};

use anyhow::{Context, Result, anyhow};
use image::{ImageReader, Limits};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::Frame;

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
/// Largest accepted width or height. Frames are downscaled to 192/224 px
/// before inference, so anything larger only costs memory.
pub const MAX_FRAME_SIDE: u32 = 4096;

/// Decodes an uploaded image into an RGBA frame.
///
/// JPEG goes through zune-jpeg; everything else (and JPEGs zune rejects)
/// goes through the `image` crate.
pub fn decode_image(bytes: &[u8]) -> Result<Frame> {
    if bytes.is_empty() {
        return Err(anyhow!("empty upload"));
    }

    if bytes.starts_with(&JPEG_MAGIC) {
        match jpeg_to_frame(bytes) {
            Ok(frame) => return Ok(frame),
            Err(err) => log::debug!("zune-jpeg rejected upload, falling back: {err:?}"),
        }
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_FRAME_SIDE);
    limits.max_image_height = Some(MAX_FRAME_SIDE);

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to read upload")?;
    reader.limits(limits);
    let image = reader.decode().context("unsupported, corrupt or oversized image")?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    frame_from_parts(rgba.into_raw(), width, height)
}

fn jpeg_to_frame(data: &[u8]) -> Result<Frame> {
    let options = DecoderOptions::default()
        .jpeg_set_out_colorspace(ColorSpace::RGBA)
        .set_max_width(MAX_FRAME_SIDE as usize)
        .set_max_height(MAX_FRAME_SIDE as usize);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("JPEG decode failed: {err:?}"))?;

    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("JPEG decoder produced no header info"))?;
    let width = usize::try_from(info.width)
        .ok()
        .and_then(|w| u32::try_from(w).ok())
        .ok_or_else(|| anyhow!("JPEG width does not fit u32"))?;
    let height = usize::try_from(info.height)
        .ok()
        .and_then(|h| u32::try_from(h).ok())
        .ok_or_else(|| anyhow!("JPEG height does not fit u32"))?;

    frame_from_parts(rgba, width, height)
}

fn frame_from_parts(rgba: Vec<u8>, width: u32, height: u32) -> Result<Frame> {
    if width == 0 || height == 0 {
        return Err(anyhow!("image has no pixels ({width}x{height})"));
    }
    let expected_len = (width as usize)
        .saturating_mul(height as usize)
        .saturating_mul(4);
    if rgba.len() < expected_len {
        return Err(anyhow!(
            "decoded buffer too small: got {}, expected {}",
            rgba.len(),
            expected_len
        ));
    }

    let mut rgba = rgba;
    rgba.truncate(expected_len);
    Ok(Frame {
        rgba,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    use super::*;

    fn encoded_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn encoded_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 200, 200]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    #[test]
    fn decodes_png_to_rgba() {
        let frame = decode_image(&encoded_png(7, 5)).unwrap();

        assert_eq!((frame.width, frame.height), (7, 5));
        assert_eq!(frame.rgba.len(), 7 * 5 * 4);
        assert_eq!(&frame.rgba[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn decodes_jpeg_to_rgba() {
        let frame = decode_image(&encoded_jpeg(16, 8)).unwrap();

        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.rgba.len(), 16 * 8 * 4);
        assert!(frame.rgba.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn rejects_non_image_bytes() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn rejects_empty_upload() {
        assert!(decode_image(&[]).is_err());
    }

    #[test]
    fn rejects_frames_wider_than_the_cap() {
        let wide = MAX_FRAME_SIDE + 1;
        assert!(decode_image(&encoded_png(wide, 1)).is_err());
        assert!(decode_image(&encoded_jpeg(wide, 8)).is_err());

        let frame = decode_image(&encoded_png(MAX_FRAME_SIDE, 1)).unwrap();
        assert_eq!(frame.width, MAX_FRAME_SIDE);
    }

    #[test]
    fn rejects_truncated_jpeg() {
        let mut bytes = encoded_jpeg(32, 32);
        bytes.truncate(24);
        assert!(decode_image(&bytes).is_err());
    }
}
