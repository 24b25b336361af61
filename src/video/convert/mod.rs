//! Pixel format conversion engine
//!
//! Converts packed 4:2:2 frames (UYVY/YUYV, as delivered by capture cards)
//! into the 4:2:0 layouts wanted by sinks: NV12 for encoders and YUV420
//! planar for loopback devices.
//!
//! Two kernels implement the same contract:
//! - [`SimdKernel`]: SSE2 (x86_64) / NEON (aarch64), 16 pixels per step,
//!   requires `width % 16 == 0`
//! - [`ScalarKernel`]: portable fallback, no alignment requirement
//!
//! [`convert_into`] tries the SIMD kernel first and falls back to the scalar
//! one, so callers never special-case SIMD availability. Both kernels produce
//! bit-identical output: luma is copied, chroma is the truncating mean of the
//! two source rows of each 2x2 block.

mod scalar;
mod simd;

use thiserror::Error;

use crate::video::format::{PixelFormat, Resolution};

pub use scalar::ScalarKernel;
pub use simd::SimdKernel;

/// Conversion failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("frame dimensions {width}x{height} must be positive and even")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("source buffer too small: {actual} < {expected}")]
    SourceTooSmall { expected: usize, actual: usize },

    #[error("destination buffer too small: {actual} < {expected}")]
    DestinationTooSmall { expected: usize, actual: usize },

    #[error("SIMD conversion needs a width divisible by 16, got {width}")]
    Unaligned { width: u32 },

    #[error("SIMD conversion not available on this target")]
    SimdUnavailable,

    #[error("unsupported conversion: {src} -> {dst}")]
    Unsupported { src: PixelFormat, dst: PixelFormat },
}

/// A validated (source, destination, resolution) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionPlan {
    pub src: PixelFormat,
    pub dst: PixelFormat,
    pub resolution: Resolution,
}

impl ConversionPlan {
    pub fn new(
        src: PixelFormat,
        dst: PixelFormat,
        resolution: Resolution,
    ) -> Result<Self, ConvertError> {
        if !src.is_packed_422() || !dst.is_420() {
            return Err(ConvertError::Unsupported { src, dst });
        }
        if !resolution.is_subsampling_aligned() {
            return Err(ConvertError::InvalidDimensions {
                width: resolution.width,
                height: resolution.height,
            });
        }
        Ok(Self {
            src,
            dst,
            resolution,
        })
    }

    pub fn width(&self) -> usize {
        self.resolution.width as usize
    }

    pub fn height(&self) -> usize {
        self.resolution.height as usize
    }

    /// Packed source size: `w*h*2`
    pub fn src_len(&self) -> usize {
        self.width() * self.height() * 2
    }

    /// 4:2:0 destination size: `w*h*3/2`
    pub fn dst_len(&self) -> usize {
        self.width() * self.height() * 3 / 2
    }

    /// Byte offset of the first luma sample inside a packed pixel pair
    pub fn luma_offset(&self) -> usize {
        match self.src {
            PixelFormat::Yuyv => 0,
            _ => 1,
        }
    }

    /// Byte offsets of U and V inside a packed pixel pair
    pub fn chroma_offsets(&self) -> (usize, usize) {
        let u = 1 - self.luma_offset();
        (u, u + 2)
    }

    /// Check both buffers against the size formulas
    pub fn check_buffers(&self, src: &[u8], dst: &[u8]) -> Result<(), ConvertError> {
        if src.len() < self.src_len() {
            return Err(ConvertError::SourceTooSmall {
                expected: self.src_len(),
                actual: src.len(),
            });
        }
        if dst.len() < self.dst_len() {
            return Err(ConvertError::DestinationTooSmall {
                expected: self.dst_len(),
                actual: dst.len(),
            });
        }
        Ok(())
    }
}

/// One implementation of the packed 4:2:2 -> 4:2:0 conversion
pub trait ConvertKernel {
    /// Convert `src` into the first `plan.dst_len()` bytes of `dst`
    fn convert(&self, plan: &ConversionPlan, src: &[u8], dst: &mut [u8])
        -> Result<(), ConvertError>;
}

/// Convert into a caller-owned buffer (e.g. a mapped sink buffer)
///
/// Returns the number of bytes written.
pub fn convert_into(
    src_format: PixelFormat,
    dst_format: PixelFormat,
    resolution: Resolution,
    src: &[u8],
    dst: &mut [u8],
) -> Result<usize, ConvertError> {
    let plan = ConversionPlan::new(src_format, dst_format, resolution)?;
    plan.check_buffers(src, dst)?;

    match SimdKernel.convert(&plan, src, dst) {
        Ok(()) => {}
        Err(ConvertError::Unaligned { .. }) | Err(ConvertError::SimdUnavailable) => {
            ScalarKernel.convert(&plan, src, dst)?;
        }
        Err(e) => return Err(e),
    }

    Ok(plan.dst_len())
}

/// Convert into a freshly allocated buffer of exactly `w*h*3/2` bytes
pub fn convert(
    src_format: PixelFormat,
    dst_format: PixelFormat,
    resolution: Resolution,
    src: &[u8],
) -> Result<Vec<u8>, ConvertError> {
    let plan = ConversionPlan::new(src_format, dst_format, resolution)?;
    let mut dst = vec![0u8; plan.dst_len()];
    convert_into(src_format, dst_format, resolution, src, &mut dst)?;
    Ok(dst)
}

/// Calculate packed 4:2:2 buffer size for a given resolution
pub fn packed_422_size(resolution: Resolution) -> usize {
    (resolution.pixels() * 2) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Build a packed frame from per-pixel luma and per-pair (U, V) closures
    fn packed_frame(
        format: PixelFormat,
        res: Resolution,
        luma: impl Fn(usize, usize) -> u8,
        chroma: impl Fn(usize, usize) -> (u8, u8),
    ) -> Vec<u8> {
        let (w, h) = (res.width as usize, res.height as usize);
        let mut out = Vec::with_capacity(w * h * 2);
        for y in 0..h {
            for x in (0..w).step_by(2) {
                let (u, v) = chroma(x / 2, y);
                let (y0, y1) = (luma(x, y), luma(x + 1, y));
                match format {
                    PixelFormat::Yuyv => out.extend_from_slice(&[y0, u, y1, v]),
                    _ => out.extend_from_slice(&[u, y0, v, y1]),
                }
            }
        }
        out
    }

    fn random_frame(res: Resolution, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..packed_422_size(res)).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_output_size_for_even_dimensions() {
        for (w, h) in [(2, 2), (4, 6), (16, 16), (18, 10), (640, 480), (34, 2)] {
            let res = Resolution::new(w, h);
            let src = vec![0u8; packed_422_size(res)];
            for (s, d) in [
                (PixelFormat::Uyvy, PixelFormat::Nv12),
                (PixelFormat::Yuyv, PixelFormat::Nv12),
                (PixelFormat::Yuyv, PixelFormat::Yuv420),
                (PixelFormat::Uyvy, PixelFormat::Yuv420),
            ] {
                let out = convert(s, d, res, &src).unwrap();
                assert_eq!(out.len(), (w * h * 3 / 2) as usize);
            }
        }
    }

    #[test]
    fn test_uyvy_16x16_uniform_scenario() {
        let res = Resolution::new(16, 16);
        let src = packed_frame(PixelFormat::Uyvy, res, |_, _| 100, |_, _| (50, 50));

        let out = convert(PixelFormat::Uyvy, PixelFormat::Nv12, res, &src).unwrap();

        assert_eq!(out.len(), 384);
        assert!(out[..256].iter().all(|&b| b == 100));
        assert_eq!(out[256..].len(), 128);
        assert!(out[256..].iter().all(|&b| b == 50));
    }

    #[test]
    fn test_luma_independent_of_byte_order() {
        let res = Resolution::new(20, 6);
        let luma = |x: usize, y: usize| (x * 7 + y * 13) as u8;
        let uyvy = packed_frame(PixelFormat::Uyvy, res, luma, |_, _| (0, 0));
        let yuyv = packed_frame(PixelFormat::Yuyv, res, luma, |_, _| (0, 0));

        let a = convert(PixelFormat::Uyvy, PixelFormat::Nv12, res, &uyvy).unwrap();
        let b = convert(PixelFormat::Yuyv, PixelFormat::Nv12, res, &yuyv).unwrap();

        let y_size = 20 * 6;
        assert_eq!(a[..y_size], b[..y_size]);
        for y in 0..6 {
            for x in 0..20 {
                assert_eq!(a[y * 20 + x], luma(x, y));
            }
        }
    }

    #[test]
    fn test_chroma_average_symmetric_in_rows() {
        let res = Resolution::new(16, 2);
        let top = |x: usize| ((x * 31) % 256) as u8;
        let bottom = |x: usize| ((x * 17 + 5) % 256) as u8;

        let forward = packed_frame(
            PixelFormat::Uyvy,
            res,
            |_, _| 0,
            |cx, y| if y == 0 { (top(cx), bottom(cx)) } else { (bottom(cx), top(cx)) },
        );
        let swapped = packed_frame(
            PixelFormat::Uyvy,
            res,
            |_, _| 0,
            |cx, y| if y == 0 { (bottom(cx), top(cx)) } else { (top(cx), bottom(cx)) },
        );

        let a = convert(PixelFormat::Uyvy, PixelFormat::Yuv420, res, &forward).unwrap();
        let b = convert(PixelFormat::Uyvy, PixelFormat::Yuv420, res, &swapped).unwrap();
        assert_eq!(a, b);

        // truncating mean, no rounding
        let u0 = a[32];
        assert_eq!(u0, ((top(0) as u16 + bottom(0) as u16) / 2) as u8);
    }

    #[test]
    fn test_truncating_division() {
        let res = Resolution::new(2, 2);
        // UYVY rows: U=1/V=254 on top, U=2/V=255 below
        let src = [1, 0, 254, 0, 2, 0, 255, 0];
        let out = convert(PixelFormat::Uyvy, PixelFormat::Nv12, res, &src).unwrap();
        assert_eq!(&out[4..], &[1, 254]);
    }

    #[test]
    fn test_uniform_chroma_survives() {
        for v in (0u8..=254).step_by(2) {
            let res = Resolution::new(32, 4);
            let src = packed_frame(PixelFormat::Yuyv, res, |x, _| x as u8, |_, _| (v, v));
            let nv12 = convert(PixelFormat::Yuyv, PixelFormat::Nv12, res, &src).unwrap();
            let i420 = convert(PixelFormat::Yuyv, PixelFormat::Yuv420, res, &src).unwrap();
            assert!(nv12[128..].iter().all(|&c| c == v));
            assert!(i420[128..].iter().all(|&c| c == v));
        }
    }

    #[test]
    fn test_planar_layout() {
        let res = Resolution::new(4, 2);
        let src = packed_frame(
            PixelFormat::Yuyv,
            res,
            |_, _| 9,
            |cx, _| (10 + cx as u8, 20 + cx as u8),
        );
        let out = convert(PixelFormat::Yuyv, PixelFormat::Yuv420, res, &src).unwrap();
        assert_eq!(out, vec![9, 9, 9, 9, 9, 9, 9, 9, 10, 11, 20, 21]);

        let nv12 = convert(PixelFormat::Yuyv, PixelFormat::Nv12, res, &src).unwrap();
        assert_eq!(&nv12[8..], &[10, 20, 11, 21]);
    }

    #[test]
    fn test_simd_matches_scalar() {
        for (i, (w, h)) in [(16, 2), (32, 8), (48, 6), (640, 4)].into_iter().enumerate() {
            let res = Resolution::new(w, h);
            let src = random_frame(res, i as u64);
            for (s, d) in [
                (PixelFormat::Uyvy, PixelFormat::Nv12),
                (PixelFormat::Yuyv, PixelFormat::Nv12),
                (PixelFormat::Yuyv, PixelFormat::Yuv420),
                (PixelFormat::Uyvy, PixelFormat::Yuv420),
            ] {
                let plan = ConversionPlan::new(s, d, res).unwrap();
                let mut scalar_out = vec![0u8; plan.dst_len()];
                ScalarKernel.convert(&plan, &src, &mut scalar_out).unwrap();

                let mut simd_out = vec![0u8; plan.dst_len()];
                match SimdKernel.convert(&plan, &src, &mut simd_out) {
                    Ok(()) => assert_eq!(simd_out, scalar_out, "{} -> {} at {}", s, d, res),
                    Err(ConvertError::SimdUnavailable) => {}
                    Err(e) => panic!("unexpected SIMD error: {}", e),
                }
            }
        }
    }

    #[test]
    fn test_unaligned_width_falls_back_to_scalar() {
        let res = Resolution::new(18, 4);
        let plan = ConversionPlan::new(PixelFormat::Uyvy, PixelFormat::Nv12, res).unwrap();
        let src = random_frame(res, 42);
        let mut dst = vec![0u8; plan.dst_len()];

        let simd = SimdKernel.convert(&plan, &src, &mut dst);
        assert!(matches!(
            simd,
            Err(ConvertError::Unaligned { width: 18 }) | Err(ConvertError::SimdUnavailable)
        ));

        let mut expected = vec![0u8; plan.dst_len()];
        ScalarKernel.convert(&plan, &src, &mut expected).unwrap();
        let written = convert_into(PixelFormat::Uyvy, PixelFormat::Nv12, res, &src, &mut dst).unwrap();
        assert_eq!(written, plan.dst_len());
        assert_eq!(dst, expected);
    }

    #[test]
    fn test_rejects_bad_input() {
        let res = Resolution::new(16, 16);
        assert_eq!(
            convert(PixelFormat::Uyvy, PixelFormat::Nv12, Resolution::new(15, 16), &[0; 480]),
            Err(ConvertError::InvalidDimensions {
                width: 15,
                height: 16
            })
        );
        assert_eq!(
            convert(PixelFormat::Uyvy, PixelFormat::Nv12, res, &[0; 100]),
            Err(ConvertError::SourceTooSmall {
                expected: 512,
                actual: 100
            })
        );
        assert!(matches!(
            convert(PixelFormat::Nv12, PixelFormat::Yuv420, res, &[0; 512]),
            Err(ConvertError::Unsupported { .. })
        ));

        let mut small = vec![0u8; 100];
        assert!(matches!(
            convert_into(PixelFormat::Uyvy, PixelFormat::Nv12, res, &[0; 512], &mut small),
            Err(ConvertError::DestinationTooSmall { expected: 384, .. })
        ));
    }
}
