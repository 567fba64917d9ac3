// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Streaming framer that groups Annex B NAL units into access units.

use std::io::Cursor;

use bytes::Bytes;
use bytes::BytesMut;

use crate::backend::ParseStep;
use crate::backend::StreamParser;
use crate::codec::h264::parser::starts_access_unit;
use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluError;
use crate::config::AccessUnitFraming;

/// Accumulates NAL units until an access unit is known to be complete.
///
/// An access unit is complete when the first NAL unit of the next one shows up, when an end of
/// sequence/stream NAL unit is found, or, with [`AccessUnitFraming::ChunkBoundary`], when the
/// end of the data passed to [`AccessUnitParser::parse`] is reached. Parameter sets seen before
/// any picture are kept and prefixed to the next access unit.
pub struct AccessUnitParser {
    framing: AccessUnitFraming,
    /// NAL units of the access unit being built, start codes included.
    pending: BytesMut,
    /// Last emitted access unit.
    output: Bytes,
    /// Whether `pending` contains a VCL NAL unit.
    picture_started: bool,
}

impl AccessUnitParser {
    pub fn new(framing: AccessUnitFraming) -> Self {
        Self {
            framing,
            pending: BytesMut::new(),
            output: Bytes::new(),
            picture_started: false,
        }
    }

    /// Whether some NAL units are waiting for their access unit to complete.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn emit(&mut self) -> &[u8] {
        self.output = self.pending.split().freeze();
        self.picture_started = false;
        log::debug!("access unit of {} bytes complete", self.output.len());
        &self.output
    }

    /// Feeds `data` to the parser.
    ///
    /// NAL units are consumed from the start of `data` until an access unit completes or the data
    /// runs out. A NAL unit that begins the next access unit is left unconsumed. The walk also
    /// stops, without consuming anything further, at a NAL unit that cannot be framed: a start
    /// code with no header, a set forbidden bit, or a slice header that cannot be read.
    pub fn parse(&mut self, data: &[u8]) -> ParseStep<'_> {
        let mut cursor = Cursor::new(data);
        let mut consumed = 0;

        loop {
            let nalu = match Nalu::next(&mut cursor) {
                Ok(nalu) => nalu,
                Err(NaluError::NoStartCode) => {
                    // trailing_zero_8bits after the last NAL unit.
                    if data[consumed..].iter().all(|&b| b == 0x00) {
                        consumed = data.len();
                    }
                    break;
                }
                Err(e) => {
                    log::debug!("stopping at unframeable data: {}", e);
                    break;
                }
            };

            let starts_new = match starts_access_unit(&nalu) {
                Ok(starts_new) => starts_new,
                Err(e) => {
                    log::debug!(
                        "stopping at slice with unreadable header at offset {}: {}",
                        nalu.offset(),
                        e
                    );
                    break;
                }
            };

            if self.picture_started && starts_new {
                return ParseStep {
                    consumed,
                    access_unit: Some(self.emit()),
                };
            }

            self.pending.extend_from_slice(nalu.with_start_code());
            consumed = nalu.end();

            if nalu.header.type_.is_vcl() {
                self.picture_started = true;
            }

            if nalu.header.is_end() && self.picture_started {
                return ParseStep {
                    consumed,
                    access_unit: Some(self.emit()),
                };
            }
        }

        if self.framing == AccessUnitFraming::ChunkBoundary
            && self.picture_started
            && consumed == data.len()
        {
            return ParseStep {
                consumed,
                access_unit: Some(self.emit()),
            };
        }

        ParseStep {
            consumed,
            access_unit: None,
        }
    }
}

impl StreamParser for AccessUnitParser {
    fn parse<'a>(&'a mut self, data: &'a [u8]) -> ParseStep<'a> {
        AccessUnitParser::parse(self, data)
    }
}
