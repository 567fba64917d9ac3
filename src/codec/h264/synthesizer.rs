// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes minimal baseline-profile parameter sets and slice headers.
//!
//! The slice data that follows each header is a stub: the resulting streams are good enough for
//! header parsers and the dummy backend, but a real macroblock decoder will reject them.

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::h264::parser::NaluType;

/// `profile_idc` of the constrained baseline profile.
const PROFILE_BASELINE: u8 = 66;
/// Level 3.0.
const LEVEL_IDC: u8 = 30;

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    BitWriter(#[from] BitWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// Wraps `rbsp` into an Annex B NAL unit with a 4-byte start code, inserting emulation
/// prevention bytes where needed.
fn encapsulate(ref_idc: u8, type_: NaluType, rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 5);
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    out.push((ref_idc & 0b11) << 5 | (type_ as u8 & 0b11111));

    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }

        out.push(byte);
        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
    }

    out
}

fn rbsp<F>(write: F) -> SynthesizerResult<Vec<u8>>
where
    F: FnOnce(&mut BitWriter<&mut Vec<u8>>) -> Result<(), BitWriterError>,
{
    let mut buf = Vec::new();
    {
        let mut writer = BitWriter::new(&mut buf);
        write(&mut writer)?;
        writer.write_trailing_bits()?;
        writer.flush()?;
    }

    Ok(buf)
}

/// Synthesizes a 4:2:0 8-bit sequence parameter set for a `width`x`height` picture, cropping
/// the coded size down when it is not a multiple of the macroblock size.
pub fn sps(width: u32, height: u32) -> SynthesizerResult<Vec<u8>> {
    // Cropping is expressed in units of two luma samples for 4:2:0 frames.
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(SynthesizerError::Unsupported);
    }

    let width_in_mbs = width.div_ceil(16);
    let height_in_mbs = height.div_ceil(16);
    let crop_right = (width_in_mbs * 16 - width) / 2;
    let crop_bottom = (height_in_mbs * 16 - height) / 2;

    let rbsp = rbsp(|w| {
        w.write_f(8, PROFILE_BASELINE)?;
        // constraint_set1_flag, i.e. constrained baseline.
        w.write_f(8, 0b0100_0000u8)?;
        w.write_f(8, LEVEL_IDC)?;
        // seq_parameter_set_id
        w.write_ue(0)?;
        // log2_max_frame_num_minus4
        w.write_ue(0)?;
        // pic_order_cnt_type
        w.write_ue(2)?;
        // max_num_ref_frames
        w.write_ue(1)?;
        // gaps_in_frame_num_value_allowed_flag
        w.write_bit(false)?;
        w.write_ue(width_in_mbs - 1)?;
        w.write_ue(height_in_mbs - 1)?;
        // frame_mbs_only_flag
        w.write_bit(true)?;
        // direct_8x8_inference_flag
        w.write_bit(true)?;

        let cropping = crop_right != 0 || crop_bottom != 0;
        w.write_bit(cropping)?;
        if cropping {
            w.write_ue(0)?;
            w.write_ue(crop_right)?;
            w.write_ue(0)?;
            w.write_ue(crop_bottom)?;
        }

        // vui_parameters_present_flag
        w.write_bit(false)?;
        Ok(())
    })?;

    Ok(encapsulate(3, NaluType::Sps, &rbsp))
}

/// Synthesizes a CAVLC picture parameter set referring to the SPS of [`sps`].
pub fn pps() -> SynthesizerResult<Vec<u8>> {
    let rbsp = rbsp(|w| {
        // pic_parameter_set_id, seq_parameter_set_id
        w.write_ue(0)?;
        w.write_ue(0)?;
        // entropy_coding_mode_flag, bottom_field_pic_order_in_frame_present_flag
        w.write_bit(false)?;
        w.write_bit(false)?;
        // num_slice_groups_minus1
        w.write_ue(0)?;
        // num_ref_idx_l0_default_active_minus1, num_ref_idx_l1_default_active_minus1
        w.write_ue(0)?;
        w.write_ue(0)?;
        // weighted_pred_flag, weighted_bipred_idc
        w.write_bit(false)?;
        w.write_f(2, 0u8)?;
        // pic_init_qp_minus26, pic_init_qs_minus26, chroma_qp_index_offset
        w.write_se(0)?;
        w.write_se(0)?;
        w.write_se(0)?;
        // deblocking_filter_control_present_flag
        w.write_bit(true)?;
        // constrained_intra_pred_flag, redundant_pic_cnt_present_flag
        w.write_bit(false)?;
        w.write_bit(false)?;
        Ok(())
    })?;

    Ok(encapsulate(3, NaluType::Pps, &rbsp))
}

fn slice_tail(w: &mut BitWriter<&mut Vec<u8>>) -> Result<(), BitWriterError> {
    // slice_qp_delta
    w.write_se(0)?;
    // disable_deblocking_filter_idc
    w.write_ue(1)?;
    Ok(())
}

/// Synthesizes an I slice of an IDR picture starting at the first macroblock.
pub fn idr_slice(idr_pic_id: u32) -> SynthesizerResult<Vec<u8>> {
    let rbsp = rbsp(|w| {
        // first_mb_in_slice, slice_type (I, all slices), pic_parameter_set_id
        w.write_ue(0)?;
        w.write_ue(7)?;
        w.write_ue(0)?;
        // frame_num
        w.write_f(4, 0u8)?;
        w.write_ue(idr_pic_id)?;
        // no_output_of_prior_pics_flag, long_term_reference_flag
        w.write_bit(false)?;
        w.write_bit(false)?;
        slice_tail(w)
    })?;

    Ok(encapsulate(3, NaluType::SliceIdr, &rbsp))
}

/// Synthesizes a P slice of a reference picture.
///
/// A `first_mb_in_slice` other than zero produces a continuation slice of the current picture.
pub fn p_slice(frame_num: u8, first_mb_in_slice: u32) -> SynthesizerResult<Vec<u8>> {
    if frame_num >= 16 {
        return Err(SynthesizerError::Unsupported);
    }

    let rbsp = rbsp(|w| {
        w.write_ue(first_mb_in_slice)?;
        // slice_type (P, all slices), pic_parameter_set_id
        w.write_ue(5)?;
        w.write_ue(0)?;
        w.write_f(4, frame_num)?;
        // num_ref_idx_active_override_flag, ref_pic_list_modification_flag_l0
        w.write_bit(false)?;
        w.write_bit(false)?;
        // adaptive_ref_pic_marking_mode_flag
        w.write_bit(false)?;
        slice_tail(w)
    })?;

    Ok(encapsulate(2, NaluType::Slice, &rbsp))
}

/// An access delimiter-free IDR access unit: SPS, PPS and one IDR slice.
pub fn idr_access_unit(width: u32, height: u32) -> SynthesizerResult<Vec<u8>> {
    let mut out = sps(width, height)?;
    out.extend(pps()?);
    out.extend(idr_slice(0)?);
    Ok(out)
}

/// An end of stream NAL unit.
pub fn end_of_stream() -> Vec<u8> {
    encapsulate(0, NaluType::StreamEnd, &[])
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h264::parser::Nalu;

    #[test]
    fn emulation_prevention_is_inserted() {
        let nalu = encapsulate(0, NaluType::Sei, &[0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x04]);
        assert_eq!(
            nalu,
            vec![0x00, 0x00, 0x00, 0x01, 0x06, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x04]
        );
    }

    #[test]
    fn odd_sizes_are_unsupported() {
        assert!(matches!(sps(63, 64), Err(SynthesizerError::Unsupported)));
        assert!(matches!(sps(0, 64), Err(SynthesizerError::Unsupported)));
    }

    #[test]
    fn access_unit_layout() {
        let au = idr_access_unit(64, 64).unwrap();
        let mut cursor = Cursor::new(&au[..]);

        let types: Vec<NaluType> = std::iter::from_fn(|| Nalu::next(&mut cursor).ok())
            .map(|nalu| nalu.header.type_)
            .collect();
        assert_eq!(types, vec![NaluType::Sps, NaluType::Pps, NaluType::SliceIdr]);
    }
}
