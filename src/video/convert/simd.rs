//! SIMD conversion kernel
//!
//! Processes 16 pixels (32 packed bytes) of two source rows per step:
//! - x86_64: SSE2 (always present on the target)
//! - aarch64: NEON, de-interleaving loads (`vld4`) and halving adds
//!
//! SSE2 has no truncating byte average, so `avg_epu8` (which rounds up) is
//! corrected by subtracting the low bit of `a ^ b`.

use super::{ConversionPlan, ConvertError, ConvertKernel};

/// Pixels handled per SIMD step
const LANE_PIXELS: u32 = 16;

/// SIMD kernel, requires `width % 16 == 0`
#[derive(Debug, Clone, Copy, Default)]
pub struct SimdKernel;

impl ConvertKernel for SimdKernel {
    fn convert(
        &self,
        plan: &ConversionPlan,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(), ConvertError> {
        if plan.resolution.width % LANE_PIXELS != 0 {
            return Err(ConvertError::Unaligned {
                width: plan.resolution.width,
            });
        }
        plan.check_buffers(src, dst)?;
        dispatch(plan, src, dst)
    }
}

#[cfg(target_arch = "x86_64")]
fn dispatch(plan: &ConversionPlan, src: &[u8], dst: &mut [u8]) -> Result<(), ConvertError> {
    // SAFETY: buffer sizes were checked against the plan and width is a
    // multiple of 16, so every 32-byte load and 16/8-byte store is in bounds.
    unsafe { sse2::convert(plan, src, dst) };
    Ok(())
}

#[cfg(target_arch = "aarch64")]
fn dispatch(plan: &ConversionPlan, src: &[u8], dst: &mut [u8]) -> Result<(), ConvertError> {
    if !std::arch::is_aarch64_feature_detected!("neon") {
        return Err(ConvertError::SimdUnavailable);
    }
    // SAFETY: same bounds argument as the SSE2 path; NEON presence checked above.
    unsafe { neon::convert(plan, src, dst) };
    Ok(())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn dispatch(_plan: &ConversionPlan, _src: &[u8], _dst: &mut [u8]) -> Result<(), ConvertError> {
    Err(ConvertError::SimdUnavailable)
}

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use std::arch::x86_64::*;

    use super::ConversionPlan;
    use crate::video::format::PixelFormat;

    /// Split 32 packed bytes into (16 luma, 8 interleaved U/V pairs)
    #[inline(always)]
    unsafe fn split(lo: __m128i, hi: __m128i, luma_first: bool) -> (__m128i, __m128i) {
        let mask = _mm_set1_epi16(0x00ff);
        let even = _mm_packus_epi16(_mm_and_si128(lo, mask), _mm_and_si128(hi, mask));
        let odd = _mm_packus_epi16(_mm_srli_epi16(lo, 8), _mm_srli_epi16(hi, 8));
        if luma_first {
            (even, odd)
        } else {
            (odd, even)
        }
    }

    /// Per-byte `(a + b) / 2`, truncating
    #[inline(always)]
    unsafe fn average(a: __m128i, b: __m128i) -> __m128i {
        let round_bit = _mm_and_si128(_mm_xor_si128(a, b), _mm_set1_epi8(1));
        _mm_sub_epi8(_mm_avg_epu8(a, b), round_bit)
    }

    #[target_feature(enable = "sse2")]
    pub(super) unsafe fn convert(plan: &ConversionPlan, src: &[u8], dst: &mut [u8]) {
        let width = plan.width();
        let height = plan.height();
        let row_len = width * 2;
        let y_size = width * height;
        let luma_first = plan.luma_offset() == 0;
        let planar = plan.dst == PixelFormat::Yuv420;
        let mask = _mm_set1_epi16(0x00ff);
        let zero = _mm_setzero_si128();

        let src_ptr = src.as_ptr();
        let y_ptr = dst.as_mut_ptr();
        let chroma_ptr = y_ptr.add(y_size);
        let v_ptr = chroma_ptr.add(y_size / 4);

        for cy in 0..height / 2 {
            let top = src_ptr.add(2 * cy * row_len);
            let bottom = top.add(row_len);
            let y_top = y_ptr.add(2 * cy * width);
            let y_bottom = y_top.add(width);

            for x in (0..width).step_by(16) {
                let t0 = _mm_loadu_si128(top.add(x * 2) as *const __m128i);
                let t1 = _mm_loadu_si128(top.add(x * 2 + 16) as *const __m128i);
                let b0 = _mm_loadu_si128(bottom.add(x * 2) as *const __m128i);
                let b1 = _mm_loadu_si128(bottom.add(x * 2 + 16) as *const __m128i);

                let (luma_t, chroma_t) = split(t0, t1, luma_first);
                let (luma_b, chroma_b) = split(b0, b1, luma_first);
                _mm_storeu_si128(y_top.add(x) as *mut __m128i, luma_t);
                _mm_storeu_si128(y_bottom.add(x) as *mut __m128i, luma_b);

                let uv = average(chroma_t, chroma_b);
                if planar {
                    let u = _mm_packus_epi16(_mm_and_si128(uv, mask), zero);
                    let v = _mm_packus_epi16(_mm_srli_epi16(uv, 8), zero);
                    let offset = cy * (width / 2) + x / 2;
                    _mm_storel_epi64(chroma_ptr.add(offset) as *mut __m128i, u);
                    _mm_storel_epi64(v_ptr.add(offset) as *mut __m128i, v);
                } else {
                    _mm_storeu_si128(chroma_ptr.add(cy * width + x) as *mut __m128i, uv);
                }
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    use super::ConversionPlan;
    use crate::video::format::PixelFormat;

    #[target_feature(enable = "neon")]
    pub(super) unsafe fn convert(plan: &ConversionPlan, src: &[u8], dst: &mut [u8]) {
        let width = plan.width();
        let height = plan.height();
        let row_len = width * 2;
        let y_size = width * height;
        let luma_first = plan.luma_offset() == 0;
        let planar = plan.dst == PixelFormat::Yuv420;

        let src_ptr = src.as_ptr();
        let y_ptr = dst.as_mut_ptr();
        let chroma_ptr = y_ptr.add(y_size);
        let v_ptr = chroma_ptr.add(y_size / 4);

        for cy in 0..height / 2 {
            let top = src_ptr.add(2 * cy * row_len);
            let bottom = top.add(row_len);
            let y_top = y_ptr.add(2 * cy * width);
            let y_bottom = y_top.add(width);

            for x in (0..width).step_by(16) {
                // UYVY: {U, Y0, V, Y1}, YUYV: {Y0, U, Y1, V}
                let t = vld4_u8(top.add(x * 2));
                let b = vld4_u8(bottom.add(x * 2));

                let (luma_t, luma_b, u, v) = if luma_first {
                    (
                        uint8x8x2_t(t.0, t.2),
                        uint8x8x2_t(b.0, b.2),
                        vhadd_u8(t.1, b.1),
                        vhadd_u8(t.3, b.3),
                    )
                } else {
                    (
                        uint8x8x2_t(t.1, t.3),
                        uint8x8x2_t(b.1, b.3),
                        vhadd_u8(t.0, b.0),
                        vhadd_u8(t.2, b.2),
                    )
                };

                vst2_u8(y_top.add(x), luma_t);
                vst2_u8(y_bottom.add(x), luma_b);

                if planar {
                    let offset = cy * (width / 2) + x / 2;
                    vst1_u8(chroma_ptr.add(offset), u);
                    vst1_u8(v_ptr.add(offset), v);
                } else {
                    vst2_u8(chroma_ptr.add(cy * width + x), uint8x8x2_t(u, v));
                }
            }
        }
    }
}
