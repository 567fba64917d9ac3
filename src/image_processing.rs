// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software conversion of 4:2:0 YUV frames to packed RGB24.

use crate::OUTPUT_BYTES_PER_PIXEL;

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Converts one limited-range BT.601 sample to RGB.
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Converts an I420 frame in `src` into packed RGB24 in `dst`.
///
/// `strides` and `offsets` give the stride and starting position of each plane in `src`. Lines
/// of `dst` are `dst_stride` bytes apart. Chroma is point-sampled.
pub fn i420_to_rgb24(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 3],
    offsets: [usize; 3],
    dst_stride: usize,
) {
    let uv_width = (width + 1) / 2;

    for (row, dst_line) in dst.chunks_mut(dst_stride).take(height).enumerate() {
        let y_line = &src[offsets[0] + row * strides[0]..][..width];
        let u_line = &src[offsets[1] + (row / 2) * strides[1]..][..uv_width];
        let v_line = &src[offsets[2] + (row / 2) * strides[2]..][..uv_width];

        for (x, (pixel, &y)) in dst_line[..width * OUTPUT_BYTES_PER_PIXEL]
            .chunks_exact_mut(OUTPUT_BYTES_PER_PIXEL)
            .zip(y_line)
            .enumerate()
        {
            pixel.copy_from_slice(&yuv_to_rgb(y, u_line[x / 2], v_line[x / 2]));
        }
    }
}

/// Converts an NV12 frame in `src` into packed RGB24 in `dst`.
///
/// Same as [`i420_to_rgb24`], but with interleaved chroma.
pub fn nv12_to_rgb24(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
    dst_stride: usize,
) {
    // Two components per chroma sample.
    let uv_width = (width + 1) / 2 * 2;

    for (row, dst_line) in dst.chunks_mut(dst_stride).take(height).enumerate() {
        let y_line = &src[offsets[0] + row * strides[0]..][..width];
        let uv_line = &src[offsets[1] + (row / 2) * strides[1]..][..uv_width];

        for (x, (pixel, &y)) in dst_line[..width * OUTPUT_BYTES_PER_PIXEL]
            .chunks_exact_mut(OUTPUT_BYTES_PER_PIXEL)
            .zip(y_line)
            .enumerate()
        {
            let uv = &uv_line[x / 2 * 2..];
            pixel.copy_from_slice(&yuv_to_rgb(y, uv[0], uv[1]));
        }
    }
}
