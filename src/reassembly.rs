//! Frame reassembly records. Each frame under assembly tracks the byte
//! intervals still missing from its stream range; a frame with no gaps left
//! is ready for dispatch.

use crate::frame::{FrameHeader, FrameKind};

/// A byte interval still missing inside a frame, in frame-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub begin: u64,
    pub end: u64,
}

/// Mark [begin, end) as received, splitting or shrinking the gaps it covers.
pub fn remove_gap(gaps: &mut Vec<Gap>, begin: u64, end: u64) {
    let mut i = 0;
    while i < gaps.len() {
        let gap = gaps[i];
        if gap.end <= begin {
            i += 1;
            continue;
        }
        if gap.begin >= end {
            break;
        }

        if gap.begin < begin && gap.end > end {
            // Received range lands mid-gap: split.
            gaps[i].end = begin;
            gaps.insert(
                i + 1,
                Gap {
                    begin: end,
                    end: gap.end,
                },
            );
            return;
        }

        if gap.begin >= begin && gap.end <= end {
            gaps.remove(i);
            continue;
        }

        if gap.begin >= begin {
            gaps[i].begin = end;
        } else {
            gaps[i].end = begin;
        }
        i += 1;
    }
}

/// A frame being reassembled from stream bytes.
///
/// Non-DATA frames aggregate their whole wire image (header included) into
/// `payload` before dispatch. DATA frames never store a payload: their body
/// bytes stream straight to the application in offset order, tracked by the
/// `delivered` watermark.
#[derive(Debug)]
pub struct ActiveFrame {
    pub kind: FrameKind,
    /// Stream offset of the frame header.
    pub offset: u64,
    /// Total frame length on the wire, header included.
    pub len: u64,
    pub payload: Vec<u8>,
    pub gaps: Vec<Gap>,

    // DATA frames only.
    /// Stream offset of the first body byte.
    pub end_header_offset: u64,
    /// Subtracted from a stream offset to get the HTTP body offset.
    pub data_offset_adjust: u64,
    /// Frame-local watermark of body bytes handed to the application.
    pub delivered: u64,
    /// An end-of-data signal has been emitted for this frame.
    pub fin_signalled: bool,
}

impl ActiveFrame {
    /// A non-DATA frame covering [offset, offset + total_len).
    pub fn control(header: FrameHeader, offset: u64) -> Self {
        let len = header.total_len() as u64;
        ActiveFrame {
            kind: header.kind,
            offset,
            len,
            payload: vec![0u8; len as usize],
            gaps: vec![Gap { begin: 0, end: len }],
            end_header_offset: 0,
            data_offset_adjust: 0,
            delivered: 0,
            fin_signalled: false,
        }
    }

    /// A DATA frame. The header bytes are consumed by the caller at
    /// registration time, so delivery starts at the first body byte.
    pub fn data(header: FrameHeader, offset: u64, data_frames_total: u64) -> Self {
        let len = header.total_len() as u64;
        let end_header_offset = offset + header.header_len as u64;
        ActiveFrame {
            kind: FrameKind::DATA,
            offset,
            len,
            payload: Vec::new(),
            gaps: Vec::new(),
            end_header_offset,
            data_offset_adjust: end_header_offset - data_frames_total,
            delivered: header.header_len as u64,
            fin_signalled: false,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Copy received bytes into the payload. `begin` is frame-local; the
    /// slice is clipped to the frame range.
    pub fn fill(&mut self, begin: u64, data: &[u8]) -> usize {
        let take = data.len().min((self.len - begin) as usize);
        self.payload[begin as usize..begin as usize + take].copy_from_slice(&data[..take]);
        remove_gap(&mut self.gaps, begin, begin + take as u64);
        take
    }

    pub fn is_ready(&self) -> bool {
        if self.kind == FrameKind::DATA {
            self.delivered >= self.len
        } else {
            self.gaps.is_empty()
        }
    }
}
