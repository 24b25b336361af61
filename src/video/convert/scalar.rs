//! Portable conversion kernel

use super::{ConversionPlan, ConvertError, ConvertKernel};
use crate::video::format::PixelFormat;

/// Scalar kernel, works for any even resolution
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarKernel;

impl ConvertKernel for ScalarKernel {
    fn convert(
        &self,
        plan: &ConversionPlan,
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(), ConvertError> {
        plan.check_buffers(src, dst)?;

        let width = plan.width();
        let height = plan.height();
        let row_len = width * 2;
        let y_size = width * height;
        let (u_off, v_off) = plan.chroma_offsets();

        let (y_plane, chroma) = dst[..plan.dst_len()].split_at_mut(y_size);

        // Luma: every other byte of the packed source
        for (out, &luma) in y_plane
            .iter_mut()
            .zip(src[plan.luma_offset()..].iter().step_by(2))
        {
            *out = luma;
        }

        let rows = src[..plan.src_len()].chunks_exact(row_len * 2);
        match plan.dst {
            PixelFormat::Nv12 => {
                for (pair, uv_row) in rows.zip(chroma.chunks_exact_mut(width)) {
                    let (top, bottom) = pair.split_at(row_len);
                    for (x, uv) in (0..row_len).step_by(4).zip(uv_row.chunks_exact_mut(2)) {
                        uv[0] = average(top[x + u_off], bottom[x + u_off]);
                        uv[1] = average(top[x + v_off], bottom[x + v_off]);
                    }
                }
            }
            _ => {
                let half_width = width / 2;
                let (u_plane, v_plane) = chroma.split_at_mut(y_size / 4);
                let out_rows = u_plane
                    .chunks_exact_mut(half_width)
                    .zip(v_plane.chunks_exact_mut(half_width));
                for (pair, (u_row, v_row)) in rows.zip(out_rows) {
                    let (top, bottom) = pair.split_at(row_len);
                    for (cx, x) in (0..row_len).step_by(4).enumerate() {
                        u_row[cx] = average(top[x + u_off], bottom[x + u_off]);
                        v_row[cx] = average(top[x + v_off], bottom[x + v_off]);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Integer mean of two samples, truncating
#[inline]
fn average(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16) / 2) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    #[test]
    fn test_average_truncates() {
        assert_eq!(average(1, 2), 1);
        assert_eq!(average(255, 255), 255);
        assert_eq!(average(0, 255), 127);
        assert_eq!(average(7, 4), average(4, 7));
    }

    #[test]
    fn test_odd_multiple_of_two_width() {
        // 6 pixels wide: not SIMD friendly, scalar must still cover every column
        let res = Resolution::new(6, 2);
        let plan = ConversionPlan::new(PixelFormat::Uyvy, PixelFormat::Nv12, res).unwrap();
        let src: Vec<u8> = (0..plan.src_len() as u8).collect();
        let mut dst = vec![0xAAu8; plan.dst_len()];

        ScalarKernel.convert(&plan, &src, &mut dst).unwrap();

        assert_eq!(&dst[..6], &[1, 3, 5, 7, 9, 11]);
        assert_eq!(&dst[6..12], &[13, 15, 17, 19, 21, 23]);
        // U from bytes 0/12, V from bytes 2/14, ...
        assert_eq!(&dst[12..], &[6, 8, 10, 12, 14, 16]);
    }
}
