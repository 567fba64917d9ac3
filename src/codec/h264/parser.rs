// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Just enough of the H.264 syntax to frame an Annex-B stream into access units and to learn
//! the picture geometry from a sequence parameter set.

use std::io::Cursor;

use anyhow::anyhow;
use enumn::N;
use thiserror::Error;

use crate::bitstream_utils::BitReader;
use crate::bitstream_utils::ReadBitsResult;

/// The maximum number of reference frames in the DPB, as per A.3.1, clause h)
const DPB_MAX_SIZE: u32 = 16;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    Reserved17 = 17,
    Reserved18 = 18,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether this NAL unit carries coded slice data of the primary picture.
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NaluError {
    #[error("no start code found")]
    NoStartCode,
    #[error("start code at offset {0} is not followed by a NAL header")]
    MissingHeader(usize),
    #[error("forbidden_zero_bit is set in the NAL header at offset {0}")]
    ForbiddenBit(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
}

impl NaluHeader {
    fn parse(byte: u8) -> Option<Self> {
        if byte & 0x80 != 0 {
            return None;
        }

        Some(NaluHeader {
            ref_idc: (byte & 0x60) >> 5,
            // Reserved and unspecified values are carried as `Unknown`.
            type_: NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown),
        })
    }

    /// Whether this header type indicates EOS.
    pub fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    /// The length of the header.
    pub fn len(&self) -> usize {
        1
    }
}

/// An Annex B encoded NAL unit borrowed from the stream it was found in.
#[derive(Debug)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The stream that backs this NALU.
    data: &'a [u8],
    size: usize,
    offset: usize,
    sc_offset: usize,
}

impl<'a> Nalu<'a> {
    /// Position of the first `00 00 01` of `data[from..]`, relative to `from`.
    fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
        data[from..]
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
    }

    /// Find the next Annex B encoded NAL unit starting at the cursor position. On success the
    /// cursor is left at the end of the returned NAL unit.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> Result<Nalu<'a>, NaluError> {
        let data: &'a [u8] = cursor.get_ref();
        let from = (cursor.position() as usize).min(data.len());

        let start_code = from + Self::find_start_code(data, from).ok_or(NaluError::NoStartCode)?;
        let offset = start_code + 3;
        // A zero_byte right before makes it a 4-byte start code.
        let sc_offset = match start_code.checked_sub(1) {
            Some(prev) if prev >= from && data[prev] == 0x00 => prev,
            _ => start_code,
        };

        let header = match data.get(offset) {
            Some(&byte) => NaluHeader::parse(byte).ok_or(NaluError::ForbiddenBit(offset))?,
            None => return Err(NaluError::MissingHeader(sc_offset)),
        };

        let size = if header.is_end() {
            header.len()
        } else {
            let body_start = offset + header.len();
            let body_end = Self::find_start_code(data, body_start)
                .map_or(data.len(), |next| body_start + next);
            // trailing_zero_8bits and the zero_byte of the next start code.
            let trailing_zeros = data[body_start..body_end]
                .iter()
                .rev()
                .take_while(|&&byte| byte == 0x00)
                .count();

            body_end - trailing_zeros - offset
        };

        cursor.set_position((offset + size) as u64);

        Ok(Nalu {
            header,
            data,
            size,
            offset,
            sc_offset,
        })
    }

    /// Size of the NAL unit, header included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the NAL header within the stream.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset of the start code (including its zero_byte, if any) within the stream.
    pub fn sc_offset(&self) -> usize {
        self.sc_offset
    }

    /// Offset one past the last byte of the NAL unit.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// The NAL unit preceded by its start code.
    pub fn with_start_code(&self) -> &'a [u8] {
        &self.data[self.sc_offset..self.end()]
    }

    /// The RBSP part of the NAL unit, still containing emulation prevention bytes.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.offset + self.header.len()..self.end()]
    }
}

impl<'a> AsRef<[u8]> for Nalu<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.end()]
    }
}

/// The first three syntax elements of `slice_header()`, which is all access unit framing needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeaderPrefix {
    pub first_mb_in_slice: u32,
    pub slice_type: u32,
    pub pic_parameter_set_id: u32,
}

impl SliceHeaderPrefix {
    pub fn parse(nalu: &Nalu) -> ReadBitsResult<Self> {
        let mut r = BitReader::new(nalu.payload(), true);

        Ok(SliceHeaderPrefix {
            first_mb_in_slice: r.read_ue()?,
            slice_type: r.read_ue_max(9)?,
            pic_parameter_set_id: r.read_ue_max(255)?,
        })
    }
}

/// Whether `nalu` begins a new access unit, as per 7.4.1.2.3.
///
/// Slices only start a new access unit when they carry the first macroblock of a picture; a
/// slice whose header cannot be read is reported as an error. Data partitions B and C start with
/// `slice_id` and always belong to the picture of the preceding partition A.
pub fn starts_access_unit(nalu: &Nalu) -> ReadBitsResult<bool> {
    match nalu.header.type_ {
        NaluType::AuDelimiter
        | NaluType::Sps
        | NaluType::Pps
        | NaluType::Sei
        | NaluType::PrefixUnit
        | NaluType::SubsetSps
        | NaluType::DepthSps
        | NaluType::Reserved17
        | NaluType::Reserved18 => Ok(true),
        NaluType::Slice | NaluType::SliceDpa | NaluType::SliceIdr => {
            Ok(SliceHeaderPrefix::parse(nalu)?.first_mb_in_slice == 0)
        }
        _ => Ok(false),
    }
}

/// The parts of a sequence parameter set that determine the picture geometry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub seq_scaling_matrix_present_flag: bool,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub max_num_ref_frames: u8,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
}

impl Sps {
    fn skip_scaling_list(r: &mut BitReader, size: usize) -> anyhow::Result<()> {
        // 7.3.2.1.1.1
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;

        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale = r.read_se()?;
                let sum = i64::from(last_scale) + i64::from(delta_scale);
                next_scale = sum.rem_euclid(256) as i32;
            }

            if next_scale != 0 {
                last_scale = next_scale;
            }
        }

        Ok(())
    }

    pub fn parse(nalu: &Nalu) -> anyhow::Result<Sps> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            ));
        }

        let mut r = BitReader::new(nalu.payload(), true);
        let mut sps = Sps {
            profile_idc: r.read_bits(8)? as u8,
            ..Default::default()
        };

        // constraint_set0..5_flag and reserved_zero_2bits
        r.skip_bits(8)?;

        sps.level_idc = r.read_bits(8)? as u8;
        sps.seq_parameter_set_id = r.read_ue_max(31)? as u8;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.read_ue_max(3)? as u8;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)? as u8;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)? as u8;
            // qpprime_y_zero_transform_bypass_flag
            r.skip_bits(1)?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                let num_lists = if sps.chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..num_lists {
                    if r.read_bit()? {
                        Self::skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)? as u8;
        sps.pic_order_cnt_type = r.read_ue_max(2)? as u8;

        if sps.pic_order_cnt_type == 0 {
            // log2_max_pic_order_cnt_lsb_minus4
            r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            // delta_pic_order_always_zero_flag, offset_for_non_ref_pic,
            // offset_for_top_to_bottom_field
            r.skip_bits(1)?;
            r.read_se()?;
            r.read_se()?;

            let num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;
            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                r.read_se()?;
            }
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE)? as u8;
        // gaps_in_frame_num_value_allowed_flag
        r.skip_bits(1)?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            // mb_adaptive_frame_field_flag
            r.skip_bits(1)?;
        }

        // direct_8x8_inference_flag
        r.skip_bits(1)?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            if sps.cropped_size().is_none() {
                return Err(anyhow!(
                    "cropping window ({}, {}, {}, {}) exceeds the {}x{} picture",
                    sps.frame_crop_left_offset,
                    sps.frame_crop_right_offset,
                    sps.frame_crop_top_offset,
                    sps.frame_crop_bottom_offset,
                    sps.coded_width(),
                    sps.coded_height()
                ));
            }
        }

        Ok(sps)
    }

    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17 in ITU-T H.264.
    pub fn coded_width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1).saturating_mul(16)
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17 in ITU-T H.264.
    pub fn coded_height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 + 1)
            .saturating_mul(16)
            .saturating_mul(2 - self.frame_mbs_only_flag as u32)
    }

    /// Display size, or `None` if the cropping window does not fit in the coded picture.
    fn cropped_size(&self) -> Option<(u32, u32)> {
        if !self.frame_cropping_flag {
            return Some((self.coded_width(), self.coded_height()));
        }

        let (unit_x, unit_y) = self.crop_unit_x_y();
        let crop = |first: u32, second: u32, unit: u32, coded: u32| {
            coded.checked_sub(first.checked_add(second)?.checked_mul(unit)?)
        };

        Some((
            crop(
                self.frame_crop_left_offset,
                self.frame_crop_right_offset,
                unit_x,
                self.coded_width(),
            )?,
            crop(
                self.frame_crop_top_offset,
                self.frame_crop_bottom_offset,
                unit_y,
                self.coded_height(),
            )?,
        ))
    }

    /// Display width, i.e. the coded width minus the cropping window.
    pub fn width(&self) -> u32 {
        self.cropped_size().map_or(0, |(width, _)| width)
    }

    /// Display height, i.e. the coded height minus the cropping window.
    pub fn height(&self) -> u32 {
        self.cropped_size().map_or(0, |(_, height)| height)
    }

    /// Returns `ChromaArrayType`, as computed in ITU-T H.264.
    pub fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC`.
    ///
    /// See table 6-1 in ITU-T H.264.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // undefined.
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`.
    ///
    /// See 7-19 through 7-22 in ITU-T H.264.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }
}
