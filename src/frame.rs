//! Captured frames.
//!
//! A [`Frame`] is the in-memory result of one completed exposure cycle: the
//! attachment payload verbatim plus a little metadata. Frames are never edited in
//! place; the session hub swaps the whole `Arc<Frame>` when a new one arrives.
//!
//! # Format sniffing
//!
//! | magic                    | format  |
//! |--------------------------|---------|
//! | `SIMPLE  =`              | FITS    |
//! | `XISF0100`               | XISF    |
//! | `FF D8 FF`               | JPEG    |
//! | `89 50 4E 47 0D 0A 1A 0A`| PNG     |
//! | `II*\0` / `MM\0*`        | TIFF    |
//! | anything else            | Raw     |

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// FITS header/data block size.
const FITS_BLOCK: usize = 2880;
/// FITS header card size.
const FITS_CARD: usize = 80;

/// Detected payload format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
    /// FITS image.
    Fits,
    /// XISF image.
    Xisf,
    /// JPEG image.
    Jpeg,
    /// PNG image.
    Png,
    /// TIFF image.
    Tiff,
    /// Unrecognized; treated as raw 8-bit samples.
    Raw,
}

impl FrameFormat {
    /// Identify a payload by its leading magic bytes.
    pub fn sniff(payload: &[u8]) -> Self {
        if payload.starts_with(b"SIMPLE  =") {
            FrameFormat::Fits
        } else if payload.starts_with(b"XISF0100") {
            FrameFormat::Xisf
        } else if payload.starts_with(&[0xFF, 0xD8, 0xFF]) {
            FrameFormat::Jpeg
        } else if payload.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            FrameFormat::Png
        } else if payload.starts_with(b"II*\0") || payload.starts_with(b"MM\0*") {
            FrameFormat::Tiff
        } else {
            FrameFormat::Raw
        }
    }

    /// Conventional file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            FrameFormat::Fits => "fits",
            FrameFormat::Xisf => "xisf",
            FrameFormat::Jpeg => "jpg",
            FrameFormat::Png => "png",
            FrameFormat::Tiff => "tiff",
            FrameFormat::Raw => "raw",
        }
    }
}

/// Pixel statistics of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    /// Mean sample value.
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
    /// Advertised minimum.
    pub min: f64,
    /// Advertised maximum.
    pub max: f64,
    /// Number of samples the statistics cover.
    pub samples: usize,
}

impl QualitySummary {
    /// Compute statistics over a sample iterator. `None` if empty.
    pub fn from_samples<I>(samples: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        // Welford's online mean/variance
        let mut count = 0usize;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for x in samples {
            count += 1;
            let delta = x - mean;
            mean += delta / count as f64;
            m2 += delta * (x - mean);
            min = min.min(x);
            max = max.max(x);
        }

        if count == 0 {
            return None;
        }

        Some(Self {
            mean,
            stddev: (m2 / count as f64).sqrt(),
            min,
            max,
            samples: count,
        })
    }
}

/// Result of one completed exposure.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Attachment payload, verbatim.
    pub payload: Bytes,
    /// Detected format.
    pub format: FrameFormat,
    /// When the attachment was received.
    pub captured_at: DateTime<Utc>,
    /// Requested exposure duration in seconds.
    pub exposure_s: f64,
    /// Pixel statistics, when the format is understood.
    pub quality: Option<QualitySummary>,
}

impl Frame {
    /// Build a frame from a received attachment.
    pub fn new(payload: Bytes, exposure_s: f64) -> Self {
        let format = FrameFormat::sniff(&payload);
        let quality = analyze(&payload, format);
        Self {
            payload,
            format,
            captured_at: Utc::now(),
            exposure_s,
            quality,
        }
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Compute the quality summary for payload formats we can decode.
pub fn analyze(payload: &[u8], format: FrameFormat) -> Option<QualitySummary> {
    match format {
        FrameFormat::Fits => fits_statistics(payload),
        FrameFormat::Raw => QualitySummary::from_samples(payload.iter().map(|&b| b as f64)),
        _ => None,
    }
}

/// Parsed subset of a FITS primary header.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FitsHeader {
    pub bitpix: i32,
    pub axes: Vec<usize>,
    pub bzero: f64,
    pub bscale: f64,
    /// Offset of the first data byte.
    pub data_offset: usize,
}

pub(crate) fn parse_fits_header(payload: &[u8]) -> Option<FitsHeader> {
    let mut bitpix = None;
    let mut naxis = 0usize;
    let mut axes = Vec::new();
    let mut bzero = 0.0;
    let mut bscale = 1.0;

    for (index, card) in payload.chunks_exact(FITS_CARD).enumerate() {
        let card = std::str::from_utf8(card).ok()?;
        let keyword = card.get(..8).unwrap_or(card).trim_end();
        if keyword == "END" {
            let header_len = (index + 1) * FITS_CARD;
            let data_offset = header_len.div_ceil(FITS_BLOCK) * FITS_BLOCK;
            if axes.len() != naxis {
                return None;
            }
            return Some(FitsHeader {
                bitpix: bitpix?,
                axes,
                bzero,
                bscale,
                data_offset,
            });
        }
        let Some(value) = card_value(card) else {
            continue;
        };
        match keyword {
            "BITPIX" => bitpix = value.parse().ok(),
            "NAXIS" => naxis = value.parse().ok()?,
            "BZERO" => bzero = value.parse().ok()?,
            "BSCALE" => bscale = value.parse().ok()?,
            k if k.starts_with("NAXIS") => axes.push(value.parse().ok()?),
            _ => {}
        }
    }
    None
}

fn card_value(card: &str) -> Option<&str> {
    if card.get(8..10) != Some("= ") {
        return None;
    }
    let raw = card.get(10..)?;
    let raw = raw.split('/').next().unwrap_or(raw);
    Some(raw.trim())
}

/// Statistics over the FITS data unit. `None` for headers that cannot describe
/// a readable image.
fn fits_statistics(payload: &[u8]) -> Option<QualitySummary> {
    let header = parse_fits_header(payload)?;
    let declared = header
        .axes
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))?;
    let width = match header.bitpix {
        8 => 1,
        16 => 2,
        32 | -32 => 4,
        _ => return None,
    };
    let data = payload.get(header.data_offset..)?;
    let count = declared.min(data.len() / width);

    let FitsHeader {
        bitpix,
        bzero,
        bscale,
        ..
    } = header;
    let samples = data.chunks_exact(width).take(count).map(move |c| {
        let raw = match bitpix {
            8 => f64::from(c[0]),
            16 => f64::from(i16::from_be_bytes([c[0], c[1]])),
            32 => f64::from(i32::from_be_bytes([c[0], c[1], c[2], c[3]])),
            _ => f64::from(f32::from_be_bytes([c[0], c[1], c[2], c[3]])),
        };
        bzero + bscale * raw
    });
    QualitySummary::from_samples(samples)
}

/// Encode 16-bit unsigned pixels as a minimal FITS image.
///
/// Used by the simulated camera; also handy for tests.
pub fn encode_fits_u16(width: usize, height: usize, pixels: &[u16]) -> Vec<u8> {
    let cards = [
        format!("{:<8}= {:>20}", "SIMPLE", "T"),
        format!("{:<8}= {:>20}", "BITPIX", 16),
        format!("{:<8}= {:>20}", "NAXIS", 2),
        format!("{:<8}= {:>20}", "NAXIS1", width),
        format!("{:<8}= {:>20}", "NAXIS2", height),
        format!("{:<8}= {:>20}", "BZERO", 32768),
        format!("{:<8}= {:>20}", "BSCALE", 1),
        "END".to_string(),
    ];

    let mut out = Vec::with_capacity(FITS_BLOCK + pixels.len() * 2);
    for card in cards {
        out.extend_from_slice(format!("{card:<80}").as_bytes());
    }
    out.resize(out.len().div_ceil(FITS_BLOCK) * FITS_BLOCK, b' ');

    for &p in pixels.iter().take(width * height) {
        let stored = (p as i32 - 32768) as i16;
        out.extend_from_slice(&stored.to_be_bytes());
    }
    let padded = out.len().div_ceil(FITS_BLOCK) * FITS_BLOCK;
    out.resize(padded, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_known_magics() {
        assert_eq!(FrameFormat::sniff(b"SIMPLE  =  T"), FrameFormat::Fits);
        assert_eq!(FrameFormat::sniff(b"XISF0100...."), FrameFormat::Xisf);
        assert_eq!(FrameFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), FrameFormat::Jpeg);
        assert_eq!(
            FrameFormat::sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]),
            FrameFormat::Png
        );
        assert_eq!(FrameFormat::sniff(b"II*\0rest"), FrameFormat::Tiff);
        assert_eq!(FrameFormat::sniff(b"\x01\x02\x03"), FrameFormat::Raw);
    }

    #[test]
    fn test_quality_summary() {
        let q = QualitySummary::from_samples([2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((q.mean - 5.0).abs() < 1e-12);
        assert!((q.stddev - 2.0).abs() < 1e-12);
        assert_eq!(q.min, 2.0);
        assert_eq!(q.max, 9.0);
        assert_eq!(q.samples, 8);
        assert!(QualitySummary::from_samples(std::iter::empty()).is_none());
    }

    #[test]
    fn test_fits_roundtrip_statistics() {
        let pixels: Vec<u16> = vec![100, 200, 300, 40000];
        let payload = encode_fits_u16(2, 2, &pixels);
        assert_eq!(payload.len() % FITS_BLOCK, 0);

        let header = parse_fits_header(&payload).unwrap();
        assert_eq!(header.bitpix, 16);
        assert_eq!(header.axes, vec![2, 2]);
        assert_eq!(header.data_offset, FITS_BLOCK);

        let frame = Frame::new(Bytes::from(payload), 1.5);
        assert_eq!(frame.format, FrameFormat::Fits);
        let q = frame.quality.unwrap();
        assert_eq!(q.samples, 4);
        assert_eq!(q.min, 100.0);
        assert_eq!(q.max, 40000.0);
        assert!((q.mean - 10150.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_fits_axes_yield_no_statistics() {
        let huge = 1usize << 33;
        let mut payload = encode_fits_u16(2, 2, &[1, 2, 3, 4]);
        let cards = [
            format!("{:<8}= {:>20}", "NAXIS1", huge),
            format!("{:<8}= {:>20}", "NAXIS2", huge),
        ];
        for (slot, card) in [3usize, 4].into_iter().zip(cards) {
            let start = slot * FITS_CARD;
            payload[start..start + FITS_CARD].copy_from_slice(format!("{card:<80}").as_bytes());
        }
        assert_eq!(parse_fits_header(&payload).unwrap().axes, vec![huge, huge]);

        let frame = Frame::new(Bytes::from(payload), 1.0);
        assert_eq!(frame.format, FrameFormat::Fits);
        assert!(frame.quality.is_none());
    }

    #[test]
    fn test_fits_statistics_limited_to_available_data() {
        let mut payload = encode_fits_u16(4, 4, &[7; 16]);
        let start = 3 * FITS_CARD;
        let card = format!("{:<8}= {:>20}", "NAXIS1", 1_000_000);
        payload[start..start + FITS_CARD].copy_from_slice(format!("{card:<80}").as_bytes());

        let q = Frame::new(Bytes::from(payload), 1.0).quality.unwrap();
        // the padded data block holds 1440 samples; zero padding decodes to BZERO
        assert_eq!(q.samples, FITS_BLOCK / 2);
        assert_eq!(q.min, 7.0);
        assert_eq!(q.max, 32768.0);
    }

    #[test]
    fn test_unknown_bitpix_has_no_statistics() {
        let mut payload = encode_fits_u16(2, 2, &[1, 2, 3, 4]);
        let start = FITS_CARD;
        let card = format!("{:<8}= {:>20}", "BITPIX", 64);
        payload[start..start + FITS_CARD].copy_from_slice(format!("{card:<80}").as_bytes());
        assert!(Frame::new(Bytes::from(payload), 1.0).quality.is_none());
    }

    #[test]
    fn test_raw_frame_uses_byte_samples() {
        let frame = Frame::new(Bytes::from_static(&[0, 10, 20]), 0.1);
        assert_eq!(frame.format, FrameFormat::Raw);
        assert_eq!(frame.size(), 3);
        assert_eq!(frame.quality.unwrap().max, 20.0);
    }

    #[test]
    fn test_compressed_formats_have_no_statistics() {
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0x00]), 0.1);
        assert!(frame.quality.is_none());
    }
}
