//! A pure-Rust PNG loader.
//!
//! Decodes non-interlaced and Adam7-interlaced PNG images into flat RGBA8
//! pixel buffers, with row 0 of the output at the bottom of the image.

use core::convert::{TryFrom, TryInto};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use crc32fast::Hasher;
use log::{debug, trace, warn};
use miniz_oxide::inflate::TINFLStatus;
use num_enum::TryFromPrimitive;

const PNG_MAGIC_BYTES: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

// The seven Adam7 sub-sampling grids, in decode order. Every start offset
// is strictly below its step, and the grids tile the image exactly once.
const ADAM7_START: [(usize, usize); 7] = [(0, 0), (4, 0), (0, 4), (2, 0), (0, 2), (1, 0), (0, 1)];
const ADAM7_STEP: [(usize, usize); 7] = [(8, 8), (8, 8), (4, 8), (4, 4), (2, 4), (2, 2), (1, 2)];

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive)]
pub enum BitDepth {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
    Sixteen = 16,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive)]
pub enum ColorType {
    Greyscale = 0,
    Truecolor = 2,
    Indexed = 3,
    GreyscaleAlpha = 4,
    TruecolorAlpha = 6,
}

impl ColorType {
    pub fn samples_per_pixel(&self) -> usize {
        match self {
            ColorType::Greyscale => 1,
            ColorType::Truecolor => 3,
            ColorType::Indexed => 1,
            ColorType::GreyscaleAlpha => 2,
            ColorType::TruecolorAlpha => 4,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive)]
pub enum CompressionMethod {
    Deflate = 0,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive)]
pub enum FilterMethod {
    Adaptive = 0,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive)]
pub enum FilterType {
    None = 0,
    Sub = 1,
    Up = 2,
    Average = 3,
    Paeth = 4,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, TryFromPrimitive)]
pub enum InterlaceMethod {
    None = 0,
    Adam7 = 1,
}

// Runtime dispatch key for the (color_type, bit_depth) pairs that have an
// unserialization path. Legal pairs without one (indexed and the alpha
// variants) are rejected up front rather than decoded wrong.
#[derive(Debug, Copy, Clone, PartialEq)]
enum PixelFormat {
    Greyscale1,
    Greyscale2,
    Greyscale4,
    Greyscale8,
    Greyscale16,
    Truecolor8,
    Truecolor16,
}

impl PixelFormat {
    fn new(color_type: ColorType, bit_depth: BitDepth) -> Result<Self, DecodeError> {
        let format = match color_type {
            ColorType::Greyscale => match bit_depth {
                BitDepth::One => PixelFormat::Greyscale1,
                BitDepth::Two => PixelFormat::Greyscale2,
                BitDepth::Four => PixelFormat::Greyscale4,
                BitDepth::Eight => PixelFormat::Greyscale8,
                BitDepth::Sixteen => PixelFormat::Greyscale16,
            },
            ColorType::Truecolor => match bit_depth {
                BitDepth::Eight => PixelFormat::Truecolor8,
                BitDepth::Sixteen => PixelFormat::Truecolor16,
                _ => return Err(DecodeError::InvalidColorTypeBitDepthCombination),
            },
            ColorType::Indexed => match bit_depth {
                BitDepth::One | BitDepth::Two | BitDepth::Four | BitDepth::Eight => {
                    return Err(DecodeError::UnsupportedPixelFormat(color_type, bit_depth));
                },
                BitDepth::Sixteen => return Err(DecodeError::InvalidColorTypeBitDepthCombination),
            },
            ColorType::GreyscaleAlpha | ColorType::TruecolorAlpha => match bit_depth {
                BitDepth::Eight | BitDepth::Sixteen => {
                    return Err(DecodeError::UnsupportedPixelFormat(color_type, bit_depth));
                },
                _ => return Err(DecodeError::InvalidColorTypeBitDepthCombination),
            },
        };

        Ok(format)
    }
}

/// An 8-bit-per-channel RGBA color value.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Color { r, g, b, a }
    }

    const fn grey(intensity: u8) -> Self {
        Color::new(intensity, intensity, intensity, 255)
    }
}

/// Basic facts about a decoded image.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ImageInfo {
    pub width: i32,
    pub height: i32,
    pub has_alpha: bool,
}

impl ImageInfo {
    fn from_header(header: &PngHeader) -> Self {
        ImageInfo {
            width: header.width as i32,
            height: header.height as i32,
            // The output buffer always carries an alpha channel, and that is
            // what this reports, even for opaque source formats.
            has_alpha: true,
        }
    }
}

/// The decoded IHDR chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct PngHeader {
    pub width: u32,
    pub height: u32,
    pub bit_depth: BitDepth,
    pub color_type: ColorType,
    pub compression_method: CompressionMethod,
    pub filter_method: FilterMethod,
    pub interlace_method: InterlaceMethod,
}

impl PngHeader {
    fn from_chunk(chunk: &Chunk) -> Result<Self, DecodeError> {
        if chunk.chunk_type() != ChunkType::ImageHeader {
            return Err(DecodeError::InvalidChunkType);
        }

        if chunk.data.len() < 13 {
            return Err(DecodeError::MissingBytes);
        }

        let width = read_u32(chunk.data, 0);
        let height = read_u32(chunk.data, 4);
        let bit_depth = chunk.data[8];
        let color_type = chunk.data[9];
        let compression_method = chunk.data[10];
        let filter_method = chunk.data[11];
        let interlace_method = chunk.data[12];

        Ok(PngHeader {
            width,
            height,
            bit_depth: TryFrom::try_from(bit_depth).map_err(|_| DecodeError::InvalidBitDepth)?,
            color_type: TryFrom::try_from(color_type).map_err(|_| DecodeError::InvalidColorType)?,
            compression_method: TryFrom::try_from(compression_method)
                .map_err(|_| DecodeError::InvalidCompressionMethod)?,
            filter_method: TryFrom::try_from(filter_method)
                .map_err(|_| DecodeError::InvalidFilterMethod)?,
            interlace_method: TryFrom::try_from(interlace_method)
                .map_err(|_| DecodeError::InvalidInterlaceMethod)?,
        })
    }

    pub fn samples_per_pixel(&self) -> usize {
        self.color_type.samples_per_pixel()
    }

    pub fn bits_per_pixel(&self) -> usize {
        self.bit_depth as usize * self.samples_per_pixel()
    }

    // Horizontal lookback distance for filter reconstruction.
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel() + 7) / 8
    }
}

/// The reasons a decode can fail.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Io(std::io::ErrorKind),
    InvalidMagicBytes,
    MissingBytes,
    InvalidChunkType,
    IncorrectChunkCrc,
    InvalidBitDepth,
    InvalidColorType,
    InvalidColorTypeBitDepthCombination,
    InvalidCompressionMethod,
    InvalidFilterMethod,
    InvalidInterlaceMethod,
    InvalidFilterType,
    UnsupportedPixelFormat(ColorType, BitDepth),
    Decompress(TINFLStatus),

    // The width/height specified in the image contains too many
    // bytes to address with a usize on this platform.
    IntegerOverflow,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Io(kind) => write!(f, "failed to read file: {:?}", kind),
            DecodeError::InvalidMagicBytes => write!(f, "not a PNG file"),
            DecodeError::MissingBytes => write!(f, "stream ended before a full read"),
            DecodeError::InvalidChunkType => write!(f, "unexpected chunk type"),
            DecodeError::IncorrectChunkCrc => write!(f, "critical chunk failed its CRC check"),
            DecodeError::InvalidBitDepth => write!(f, "invalid bit depth"),
            DecodeError::InvalidColorType => write!(f, "invalid color type"),
            DecodeError::InvalidColorTypeBitDepthCombination => {
                write!(f, "illegal color type / bit depth combination")
            },
            DecodeError::InvalidCompressionMethod => write!(f, "invalid compression method"),
            DecodeError::InvalidFilterMethod => write!(f, "invalid filter method"),
            DecodeError::InvalidInterlaceMethod => write!(f, "invalid interlace method"),
            DecodeError::InvalidFilterType => write!(f, "unrecognized scanline filter type"),
            DecodeError::UnsupportedPixelFormat(color_type, bit_depth) => {
                write!(f, "no decode path for {:?} at {:?} bits", color_type, bit_depth)
            },
            DecodeError::Decompress(status) => write!(f, "inflate failed: {:?}", status),
            DecodeError::IntegerOverflow => write!(f, "image too large to address"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Copy, Clone, PartialEq)]
enum ChunkType {
    ImageHeader,
    ImageData,
    ImageEnd,
    Unknown([u8; 4]),
}

impl ChunkType {
    fn from_bytes(bytes: &[u8; 4]) -> Self {
        match bytes {
            b"IHDR" => ChunkType::ImageHeader,
            b"IDAT" => ChunkType::ImageData,
            b"IEND" => ChunkType::ImageEnd,
            unknown_chunk_type => ChunkType::Unknown(*unknown_chunk_type),
        }
    }
}

#[derive(Debug)]
struct Chunk<'a> {
    tag: [u8; 4],
    data: &'a [u8],
    crc: u32,
}

impl<'a> Chunk<'a> {
    fn chunk_type(&self) -> ChunkType {
        ChunkType::from_bytes(&self.tag)
    }

    // The stored CRC covers the tag and the payload, not the length.
    fn valid(&self) -> bool {
        let mut hasher = Hasher::new();
        hasher.update(&self.tag);
        hasher.update(self.data);
        hasher.finalize() == self.crc
    }

    // Critical chunks have an uppercase first tag letter (bit 5 clear).
    fn is_critical(&self) -> bool {
        self.tag[0] & 0b0010_0000 == 0
    }

    fn tag_name(&self) -> &str {
        core::str::from_utf8(&self.tag).unwrap_or("????")
    }

    fn byte_size(&self) -> usize {
        // length bytes + tag bytes + data bytes + crc bytes
        4 + 4 + self.data.len() + 4
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn read_chunk(bytes: &[u8]) -> Result<Chunk, DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::MissingBytes);
    }

    let length = read_u32(bytes, 0) as usize;
    let bytes = &bytes[4..];

    if bytes.len() < 8 || bytes.len() - 8 < length {
        return Err(DecodeError::MissingBytes);
    }

    let tag = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let data = &bytes[4..4 + length];
    let crc = read_u32(bytes, 4 + length);

    Ok(Chunk { tag, data, crc })
}

// Geometry of one sub-image: the whole image for non-interlaced storage,
// or one of the seven Adam7 grids.
#[derive(Debug, Clone, PartialEq)]
struct Pass {
    width: usize,
    height: usize,
    bytes_per_scanline: usize,
    start: (usize, usize),
    step: (usize, usize),
}

impl Pass {
    // Small images can leave late passes without any pixels; such passes
    // contribute no scanlines to the stream.
    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

fn scanline_bytes(width: usize, bits_per_pixel: usize) -> Result<usize, DecodeError> {
    let bits = width as u64 * bits_per_pixel as u64;
    ((bits + 7) / 8).try_into().map_err(|_| DecodeError::IntegerOverflow)
}

fn grid_dimension(image: usize, start: usize, step: usize) -> usize {
    // start < step for every Adam7 grid, so this never underflows.
    (image + step - 1 - start) / step
}

fn plan_passes(header: &PngHeader) -> Result<Vec<Pass>, DecodeError> {
    let width = header.width as usize;
    let height = header.height as usize;
    let bits_per_pixel = header.bits_per_pixel();

    match header.interlace_method {
        InterlaceMethod::None => Ok(vec![Pass {
            width,
            height,
            bytes_per_scanline: scanline_bytes(width, bits_per_pixel)?,
            start: (0, 0),
            step: (1, 1),
        }]),
        InterlaceMethod::Adam7 => {
            let mut passes = Vec::with_capacity(ADAM7_START.len());

            for (&start, &step) in ADAM7_START.iter().zip(ADAM7_STEP.iter()) {
                let pass_width = grid_dimension(width, start.0, step.0);
                let pass_height = grid_dimension(height, start.1, step.1);

                passes.push(Pass {
                    width: pass_width,
                    height: pass_height,
                    bytes_per_scanline: scanline_bytes(pass_width, bits_per_pixel)?,
                    start,
                    step,
                });
            }

            Ok(passes)
        },
    }
}

fn paeth_predictor(a: u8, b: u8, c: u8) -> u8 {
    // a = left, b = above, c = upper left. Ties resolve a, then b, then c.
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();

    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

// Reverses one scanline's filter in place. `current` holds the filtered
// bytes on entry and the reconstructed bytes on return. Neighbors left of
// the first pixel and above the first row read as zero.
fn unfilter_scanline(
    filter_type: FilterType,
    bytes_per_pixel: usize,
    current: &mut [u8],
    prior: Option<&[u8]>,
) {
    match filter_type {
        FilterType::None => {},
        FilterType::Sub => {
            for i in 0..current.len() {
                let left = if i >= bytes_per_pixel { current[i - bytes_per_pixel] } else { 0 };
                current[i] = current[i].wrapping_add(left);
            }
        },
        FilterType::Up => {
            if let Some(prior) = prior {
                for (current_byte, above) in current.iter_mut().zip(prior) {
                    *current_byte = current_byte.wrapping_add(*above);
                }
            }
        },
        FilterType::Average => {
            for i in 0..current.len() {
                let left =
                    if i >= bytes_per_pixel { u16::from(current[i - bytes_per_pixel]) } else { 0 };
                let above = prior.map_or(0, |row| u16::from(row[i]));
                current[i] = current[i].wrapping_add(((left + above) / 2) as u8);
            }
        },
        FilterType::Paeth => {
            for i in 0..current.len() {
                let left = if i >= bytes_per_pixel { current[i - bytes_per_pixel] } else { 0 };
                let above = prior.map_or(0, |row| row[i]);
                let upper_left = if i >= bytes_per_pixel {
                    prior.map_or(0, |row| row[i - bytes_per_pixel])
                } else {
                    0
                };
                current[i] = current[i].wrapping_add(paeth_predictor(left, above, upper_left));
            }
        },
    }
}

// Consumes the inflated stream one filter-tagged scanline at a time, in
// pass order, and returns the reconstructed packed samples per pass.
fn reconstruct(
    header: &PngHeader,
    passes: &[Pass],
    mut data: &[u8],
) -> Result<Vec<Vec<u8>>, DecodeError> {
    let bytes_per_pixel = header.bytes_per_pixel();
    let mut buffers = Vec::with_capacity(passes.len());

    for pass in passes {
        let buffer_len = pass
            .bytes_per_scanline
            .checked_mul(pass.height)
            .ok_or(DecodeError::IntegerOverflow)?;
        let mut buffer = vec![0u8; buffer_len];

        if pass.is_empty() {
            buffers.push(buffer);
            continue;
        }

        for h in 0..pass.height {
            let (&filter_tag, rest) = data.split_first().ok_or(DecodeError::MissingBytes)?;
            let filter_type =
                FilterType::try_from(filter_tag).map_err(|_| DecodeError::InvalidFilterType)?;

            if rest.len() < pass.bytes_per_scanline {
                return Err(DecodeError::MissingBytes);
            }
            let (filtered, rest) = rest.split_at(pass.bytes_per_scanline);

            let (done_rows, tail) = buffer.split_at_mut(h * pass.bytes_per_scanline);
            let current = &mut tail[..pass.bytes_per_scanline];
            current.copy_from_slice(filtered);

            let prior =
                if h > 0 { Some(&done_rows[(h - 1) * pass.bytes_per_scanline..]) } else { None };
            unfilter_scanline(filter_type, bytes_per_pixel, current, prior);

            data = rest;
        }

        buffers.push(buffer);
    }

    Ok(buffers)
}

// Yields one RGBA color per pixel of a reconstructed scanline, expanding
// packed sub-byte samples MSB-first and truncating 16-bit samples to their
// high byte.
struct RowSamples<'a> {
    format: PixelFormat,
    scanline: &'a [u8],
    width: usize,
    cursor: usize,
}

impl<'a> RowSamples<'a> {
    fn new(format: PixelFormat, width: usize, scanline: &'a [u8]) -> Self {
        RowSamples { format, scanline, width, cursor: 0 }
    }
}

impl<'a> Iterator for RowSamples<'a> {
    type Item = Color;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.width {
            return None;
        }

        let color = match self.format {
            PixelFormat::Greyscale1 => {
                let byte = self.scanline[self.cursor / 8];
                let value = (byte >> (7 - self.cursor % 8)) & 0b1;
                Color::grey(value * 255)
            },
            PixelFormat::Greyscale2 => {
                let byte = self.scanline[self.cursor / 4];
                let value = (byte >> (6 - (self.cursor % 4) * 2)) & 0b11;
                Color::grey(value * 85)
            },
            PixelFormat::Greyscale4 => {
                let byte = self.scanline[self.cursor / 2];
                let value = (byte >> (4 - (self.cursor % 2) * 4)) & 0b1111;
                Color::grey(value * 17)
            },
            PixelFormat::Greyscale8 => Color::grey(self.scanline[self.cursor]),
            PixelFormat::Greyscale16 => Color::grey(self.scanline[self.cursor * 2]),
            PixelFormat::Truecolor8 => {
                let offset = self.cursor * 3;
                Color::new(
                    self.scanline[offset],
                    self.scanline[offset + 1],
                    self.scanline[offset + 2],
                    255,
                )
            },
            PixelFormat::Truecolor16 => {
                let offset = self.cursor * 6;
                Color::new(
                    self.scanline[offset],
                    self.scanline[offset + 2],
                    self.scanline[offset + 4],
                    255,
                )
            },
        };

        self.cursor += 1;
        Some(color)
    }
}

// Expands every pass into the output buffer. Source bytes are consumed
// strictly sequentially; only the destination index interleaves.
fn unserialize(
    header: &PngHeader,
    format: PixelFormat,
    passes: &[Pass],
    pass_bytes: &[Vec<u8>],
) -> Result<Vec<Color>, DecodeError> {
    let width = header.width as usize;
    let height = header.height as usize;
    let pixel_count = width.checked_mul(height).ok_or(DecodeError::IntegerOverflow)?;

    let mut pixels = vec![Color::new(0, 0, 0, 255); pixel_count];

    for (pass, bytes) in passes.iter().zip(pass_bytes) {
        if pass.is_empty() {
            continue;
        }

        let (start_x, start_y) = pass.start;
        let (step_x, step_y) = pass.step;

        for h in 0..pass.height {
            let scanline = &bytes[h * pass.bytes_per_scanline..][..pass.bytes_per_scanline];

            // PNG stores scanlines top to bottom; row 0 of the output is
            // the bottom row of the image.
            let dest_y = height - 1 - (start_y + step_y * h);
            let row = dest_y * width;

            for (idx, color) in RowSamples::new(format, pass.width, scanline).enumerate() {
                pixels[row + start_x + step_x * idx] = color;
            }
        }
    }

    Ok(pixels)
}

/// Decodes a PNG byte stream into image info and a flat RGBA8 pixel buffer
/// with row 0 at the bottom of the image.
pub fn decode(bytes: &[u8]) -> Result<(ImageInfo, Vec<Color>), DecodeError> {
    if bytes.len() < PNG_MAGIC_BYTES.len() {
        return Err(DecodeError::MissingBytes);
    }

    if bytes[..PNG_MAGIC_BYTES.len()] != PNG_MAGIC_BYTES {
        return Err(DecodeError::InvalidMagicBytes);
    }

    let mut rest = &bytes[PNG_MAGIC_BYTES.len()..];

    let header_chunk = read_chunk(rest)?;
    if !header_chunk.valid() {
        return Err(DecodeError::IncorrectChunkCrc);
    }

    let header = PngHeader::from_chunk(&header_chunk)?;
    let format = PixelFormat::new(header.color_type, header.bit_depth)?;
    debug!(
        "{}x{} {:?} at {:?} bits, {:?} interlacing",
        header.width, header.height, header.color_type, header.bit_depth, header.interlace_method
    );

    rest = &rest[header_chunk.byte_size()..];

    let mut compressed = Vec::new();

    while !rest.is_empty() {
        let chunk = read_chunk(rest)?;
        rest = &rest[chunk.byte_size()..];

        if !chunk.valid() {
            if chunk.is_critical() {
                return Err(DecodeError::IncorrectChunkCrc);
            }

            warn!("ignoring ancillary chunk {} with a bad checksum", chunk.tag_name());
            continue;
        }

        match chunk.chunk_type() {
            ChunkType::ImageData => compressed.extend_from_slice(chunk.data),
            ChunkType::ImageEnd => break,
            _ => trace!("skipping chunk {} ({} bytes)", chunk.tag_name(), chunk.data.len()),
        }
    }

    let inflated = miniz_oxide::inflate::decompress_to_vec_zlib(&compressed)
        .map_err(DecodeError::Decompress)?;
    debug!("inflated {} compressed bytes to {}", compressed.len(), inflated.len());

    let passes = plan_passes(&header)?;
    let reconstructed = reconstruct(&header, &passes, &inflated)?;
    let pixels = unserialize(&header, format, &passes, &reconstructed)?;

    Ok((ImageInfo::from_header(&header), pixels))
}

/// Reads and decodes a PNG file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<(ImageInfo, Vec<Color>), DecodeError> {
    let bytes = fs::read(path).map_err(|err| DecodeError::Io(err.kind()))?;
    decode(&bytes)
}

/// Checks the 8-byte PNG signature without decoding the rest of the file.
pub fn is_png<P: AsRef<Path>>(path: P) -> bool {
    let mut signature = [0u8; 8];

    match fs::File::open(path) {
        Ok(mut file) => file.read_exact(&mut signature).is_ok() && signature == PNG_MAGIC_BYTES,
        Err(_) => false,
    }
}
