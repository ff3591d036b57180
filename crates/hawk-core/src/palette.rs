//! Canvas palette enforcement and paletted PNG codec.
//!
//! The upstream canvas uses one fixed 64-entry palette. Entry 0
//! (`FF00FF`) is a transparency placeholder: in project targets it
//! means "no requirement at this pixel", in stitched canvas views it
//! means "blank". Images whose colors fall outside the palette are
//! rejected with [`PaletteError::ColorNotInPalette`].

use crate::geometry::Size;
use once_cell::sync::Lazy;
use std::io::Cursor;

// The official canvas palette. Not expected to change.
const COLORS: &str = "\
    FF00FF 000000 3C3C3C 787878 D2D2D2 FFFFFF 600018 ED1C24 FF7F27 F6AA09 F9DD3B FFFABC 0EB968 13E67B 87FF5E 0C816E \
    10AEA6 13E1BE 60F7F2 28509E 4093E4 6B50F6 99B1FB 780C99 AA38B9 E09FF9 CB007A EC1F80 F38DA9 684634 95682A F8B277 \
    AAAAAA A50E1E FA8072 E45C1A 9C8431 C5AD31 E8D45F 4A6B3A 5A944A 84C573 0F799F BBFAF2 7DC7FF 4D31B8 4A4284 7A71C4 \
    B5AEF1 9B5249 D18078 FAB6A4 DBA463 7B6352 9C846B D6B594 D18051 FFC5A5 6D643F 948C6B CDC59E 333941 6D758D B3B9D1";

/// Process-wide palette singleton.
pub static PALETTE: Lazy<Palette> = Lazy::new(Palette::official);

#[derive(Debug, thiserror::Error)]
pub enum PaletteError {
    #[error("color not in palette: #{0:06X}")]
    ColorNotInPalette(u32),
    #[error("palette index out of range: {0}")]
    IndexOutOfRange(u8),
    #[error("unsupported png pixel layout: {0:?}")]
    UnsupportedLayout(png::ColorType),
    #[error("image dimensions do not match data length")]
    BadDimensions,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("png decode failed: {0}")]
    Decode(#[from] png::DecodingError),
    #[error("png encode failed: {0}")]
    Encode(#[from] png::EncodingError),
}

/// A fixed indexed palette with exact-match lookup.
pub struct Palette {
    raw: Vec<u8>,
    // Sorted packed-RGB keys and their palette indices, for binary search.
    keys: Vec<u32>,
    values: Vec<u8>,
}

impl Palette {
    fn official() -> Self {
        let colors: Vec<u32> = COLORS
            .split_whitespace()
            .map(|hex| u32::from_str_radix(hex, 16).expect("palette literal"))
            .collect();
        let mut raw = Vec::with_capacity(colors.len() * 3);
        for &rgb in &colors {
            raw.extend_from_slice(&[(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8]);
        }
        let mut pairs: Vec<(u32, u8)> = colors
            .iter()
            .enumerate()
            .skip(1) // entry 0 is the transparency placeholder, never matched by color
            .map(|(i, &rgb)| (rgb, i as u8))
            .collect();
        // Wrong teal reported by a popular palette chart; accept it as the real one.
        pairs.push((0x10AE82, pairs.iter().find(|p| p.0 == 0x10AEA6).expect("teal").1));
        pairs.sort_by_key(|p| p.0);
        Self {
            raw,
            keys: pairs.iter().map(|p| p.0).collect(),
            values: pairs.iter().map(|p| p.1).collect(),
        }
    }

    /// Raw PLTE bytes (RGB triples).
    pub fn plte(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Palette index for an RGBA pixel. Fully transparent maps to 0.
    pub fn lookup(&self, r: u8, g: u8, b: u8, a: u8) -> Result<u8, PaletteError> {
        if a == 0 {
            return Ok(0);
        }
        let rgb = (r as u32) << 16 | (g as u32) << 8 | b as u32;
        match self.keys.binary_search(&rgb) {
            Ok(pos) => Ok(self.values[pos]),
            Err(_) => Err(PaletteError::ColorNotInPalette(rgb)),
        }
    }

    /// Decode PNG bytes into a paletted image, verifying conformance.
    ///
    /// Indexed images carrying this exact palette are taken verbatim;
    /// anything else is expanded to RGBA and matched pixel by pixel.
    pub fn decode(&self, bytes: &[u8]) -> Result<PalettedImage, PaletteError> {
        let mut decoder = png::Decoder::new(Cursor::new(bytes));
        decoder.set_transformations(png::Transformations::IDENTITY);
        let mut reader = decoder.read_info()?;
        let info = reader.info();
        let size = Size::new(info.width, info.height);
        let indexed_match = info.color_type == png::ColorType::Indexed
            && info.bit_depth == png::BitDepth::Eight
            && info.palette.as_deref() == Some(self.plte());
        if indexed_match {
            let mut data = vec![0u8; reader.output_buffer_size()];
            let frame = reader.next_frame(&mut data)?;
            data.truncate(frame.buffer_size());
            return PalettedImage::from_indices(size, data, self.len() as u8);
        }
        drop(reader);

        let mut decoder = png::Decoder::new(Cursor::new(bytes));
        decoder.set_transformations(
            png::Transformations::EXPAND
                | png::Transformations::ALPHA
                | png::Transformations::STRIP_16,
        );
        let mut reader = decoder.read_info()?;
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let frame = reader.next_frame(&mut buf)?;
        buf.truncate(frame.buffer_size());
        let mut data = Vec::with_capacity(size.area());
        match frame.color_type {
            png::ColorType::Rgba => {
                for px in buf.chunks_exact(4) {
                    data.push(self.lookup(px[0], px[1], px[2], px[3])?);
                }
            }
            png::ColorType::GrayscaleAlpha => {
                for px in buf.chunks_exact(2) {
                    data.push(self.lookup(px[0], px[0], px[0], px[1])?);
                }
            }
            other => return Err(PaletteError::UnsupportedLayout(other)),
        }
        if data.len() != size.area() {
            return Err(PaletteError::BadDimensions);
        }
        Ok(PalettedImage { size, data })
    }

    /// Encode a paletted image as an indexed PNG with index 0 transparent.
    pub fn encode(&self, img: &PalettedImage) -> Result<Vec<u8>, PaletteError> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, img.size.w, img.size.h);
            encoder.set_color(png::ColorType::Indexed);
            encoder.set_depth(png::BitDepth::Eight);
            encoder.set_palette(self.raw.clone());
            encoder.set_trns(vec![0u8]);
            let mut writer = encoder.write_header()?;
            writer.write_image_data(&img.data)?;
        }
        Ok(out)
    }
}

/// An image whose pixels are palette indices, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PalettedImage {
    pub size: Size,
    pub data: Vec<u8>,
}

impl PalettedImage {
    /// An all-transparent (index 0) image.
    pub fn blank(size: Size) -> Self {
        Self {
            data: vec![0u8; size.area()],
            size,
        }
    }

    fn from_indices(size: Size, data: Vec<u8>, palette_len: u8) -> Result<Self, PaletteError> {
        if data.len() != size.area() {
            return Err(PaletteError::BadDimensions);
        }
        if let Some(&bad) = data.iter().find(|&&idx| idx >= palette_len) {
            return Err(PaletteError::IndexOutOfRange(bad));
        }
        Ok(Self { size, data })
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.size.w as usize + x as usize]
    }

    /// Copy `src` onto this image with its top-left corner at
    /// `(dst_x, dst_y)`, clipping at the edges. Negative offsets clip
    /// the source's leading rows/columns.
    pub fn paste(&mut self, src: &PalettedImage, dst_x: i64, dst_y: i64) {
        let src_w = src.size.w as i64;
        let src_h = src.size.h as i64;
        let dst_w = self.size.w as i64;
        let dst_h = self.size.h as i64;
        let x0 = dst_x.max(0);
        let y0 = dst_y.max(0);
        let x1 = (dst_x + src_w).min(dst_w);
        let y1 = (dst_y + src_h).min(dst_h);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let row_len = (x1 - x0) as usize;
        for y in y0..y1 {
            let src_row = ((y - dst_y) * src_w + (x0 - dst_x)) as usize;
            let dst_row = (y * dst_w + x0) as usize;
            self.data[dst_row..dst_row + row_len]
                .copy_from_slice(&src.data[src_row..src_row + row_len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_has_64_entries() {
        assert_eq!(PALETTE.len(), 64);
    }

    #[test]
    fn lookup_known_colors() {
        assert_eq!(PALETTE.lookup(0x00, 0x00, 0x00, 255).unwrap(), 1);
        assert_eq!(PALETTE.lookup(0xFF, 0xFF, 0xFF, 255).unwrap(), 5);
        assert_eq!(PALETTE.lookup(0xB3, 0xB9, 0xD1, 255).unwrap(), 63);
    }

    #[test]
    fn lookup_transparent_is_zero() {
        // Any color with alpha 0 is "no pixel".
        assert_eq!(PALETTE.lookup(0x12, 0x34, 0x56, 0).unwrap(), 0);
    }

    #[test]
    fn lookup_wrong_teal_alias() {
        let canonical = PALETTE.lookup(0x10, 0xAE, 0xA6, 255).unwrap();
        assert_eq!(PALETTE.lookup(0x10, 0xAE, 0x82, 255).unwrap(), canonical);
    }

    #[test]
    fn lookup_unknown_color_fails() {
        let err = PALETTE.lookup(0x01, 0x02, 0x03, 255).unwrap_err();
        assert!(matches!(err, PaletteError::ColorNotInPalette(0x010203)));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut img = PalettedImage::blank(Size::new(7, 5));
        for (i, px) in img.data.iter_mut().enumerate() {
            *px = (i % 64) as u8;
        }
        let bytes = PALETTE.encode(&img).unwrap();
        let back = PALETTE.decode(&bytes).unwrap();
        assert_eq!(back, img);
        // Conformance is idempotent: re-encoding the decoded image is stable.
        let bytes2 = PALETTE.encode(&back).unwrap();
        assert_eq!(PALETTE.decode(&bytes2).unwrap(), img);
    }

    #[test]
    fn decode_rgba_maps_colors() {
        // 2x1 RGBA png: black, transparent.
        let mut raw = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut raw, 2, 1);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer
                .write_image_data(&[0, 0, 0, 255, 99, 99, 99, 0])
                .unwrap();
        }
        let img = PALETTE.decode(&raw).unwrap();
        assert_eq!(img.data, vec![1, 0]);
    }

    #[test]
    fn decode_rejects_foreign_color() {
        let mut raw = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut raw, 1, 1);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&[1, 2, 3, 255]).unwrap();
        }
        assert!(PALETTE.decode(&raw).is_err());
    }

    #[test]
    fn paste_clips() {
        let mut dst = PalettedImage::blank(Size::new(4, 4));
        let mut src = PalettedImage::blank(Size::new(3, 3));
        src.data.fill(7);
        dst.paste(&src, -1, -1);
        dst.paste(&src, 3, 3);
        assert_eq!(dst.pixel(0, 0), 7);
        assert_eq!(dst.pixel(1, 1), 7);
        assert_eq!(dst.pixel(2, 2), 0);
        assert_eq!(dst.pixel(3, 3), 7);
    }
}
