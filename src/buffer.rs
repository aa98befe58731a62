//! Stream byte buffers. The receive side keeps a sorted run of owned chunks,
//! merged on insert so that any contiguous span of stream bytes lives in a
//! single chunk; the send side is a queue of encoded frames with a cursor.

/// A chunk of contiguous stream bytes starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Receive-side reassembly store for one stream.
///
/// Chunks are sorted by offset, pairwise disjoint, and never adjacent: any
/// two touching or overlapping ranges are merged at insert time. QUIC
/// delivers each byte at most once with consistent content, so overlapping
/// retransmits can be discarded on either side of the seam.
#[derive(Debug, Default)]
pub struct RecvBuffers {
    chunks: Vec<Chunk>,
    fin_offset: Option<u64>,
}

impl RecvBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stream offset one past the last byte, once the fin has been seen.
    pub fn fin_offset(&self) -> Option<u64> {
        self.fin_offset
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Offset of the earliest byte still buffered.
    pub fn first_offset(&self) -> Option<u64> {
        self.chunks.first().map(|c| c.offset)
    }

    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) {
        if fin {
            self.fin_offset = Some(offset + data.len() as u64);
        }
        if data.is_empty() {
            return;
        }

        let start = offset;
        let end = offset + data.len() as u64;

        // Find the run of existing chunks that overlap or touch [start, end].
        let lo = self.chunks.partition_point(|c| c.end() < start);
        let hi = self.chunks.partition_point(|c| c.offset <= end);

        if lo == hi {
            self.chunks.insert(
                lo,
                Chunk {
                    offset,
                    data: data.to_vec(),
                },
            );
            return;
        }

        let merged_start = start.min(self.chunks[lo].offset);
        let merged_end = end.max(self.chunks[hi - 1].end());

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        merged[(start - merged_start) as usize..(end - merged_start) as usize]
            .copy_from_slice(data);

        // Existing bytes win over the newcomer where they overlap.
        for chunk in &self.chunks[lo..hi] {
            let at = (chunk.offset - merged_start) as usize;
            merged[at..at + chunk.data.len()].copy_from_slice(&chunk.data);
        }

        self.chunks.splice(
            lo..hi,
            [Chunk {
                offset: merged_start,
                data: merged,
            }],
        );
    }

    /// The contiguous bytes available at `offset`, if any, along with
    /// whether they run through to the end of the stream.
    pub fn read_at(&self, offset: u64) -> Option<(&[u8], bool)> {
        let idx = self.chunks.partition_point(|c| c.end() <= offset);
        let chunk = self.chunks.get(idx)?;
        if chunk.offset > offset {
            return None;
        }

        let slice = &chunk.data[(offset - chunk.offset) as usize..];
        let fin = self.fin_offset == Some(chunk.end());
        Some((slice, fin))
    }

    /// Drop the consumed range [offset, offset + len), splitting chunks
    /// where the range lands mid-buffer.
    pub fn pop(&mut self, offset: u64, len: usize) {
        if len == 0 {
            return;
        }
        let end = offset + len as u64;

        let mut idx = 0;
        while idx < self.chunks.len() {
            let chunk = &mut self.chunks[idx];
            if chunk.offset >= end {
                break;
            }
            if chunk.end() <= offset {
                idx += 1;
                continue;
            }

            if offset <= chunk.offset && end >= chunk.end() {
                // Whole chunk consumed.
                self.chunks.remove(idx);
                continue;
            }

            if offset <= chunk.offset {
                // Consumed prefix.
                let cut = (end - chunk.offset) as usize;
                chunk.data.drain(..cut);
                chunk.offset = end;
                idx += 1;
                continue;
            }

            if end >= chunk.end() {
                // Consumed suffix.
                let keep = (offset - chunk.offset) as usize;
                chunk.data.truncate(keep);
                idx += 1;
                continue;
            }

            // Mid-chunk: split in two.
            let tail_at = (end - chunk.offset) as usize;
            let tail = Chunk {
                offset: end,
                data: chunk.data[tail_at..].to_vec(),
            };
            chunk.data.truncate((offset - chunk.offset) as usize);
            self.chunks.insert(idx + 1, tail);
            break;
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    #[cfg(test)]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}

/// One encoded frame (or frame run) queued for sending, with a cursor over
/// the bytes the transport has already taken.
#[derive(Debug)]
pub struct SendBuf {
    pub data: Vec<u8>,
    pub pos: usize,
    pub fin: bool,
}

impl SendBuf {
    pub fn new(data: Vec<u8>, fin: bool) -> Self {
        SendBuf { data, pos: 0, fin }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    pub fn is_drained(&self) -> bool {
        self.pos >= self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(bufs: &RecvBuffers) -> Vec<(u64, u64)> {
        bufs.chunks().iter().map(|c| (c.offset, c.end())).collect()
    }

    #[test]
    fn inserts_stay_sorted_and_disjoint() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(40, &[4u8; 10], false);
        bufs.insert(0, &[0u8; 10], false);
        bufs.insert(20, &[2u8; 10], false);

        assert_eq!(spans(&bufs), vec![(0, 10), (20, 30), (40, 50)]);
    }

    #[test]
    fn adjacent_chunks_merge() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(0, &[1u8; 10], false);
        bufs.insert(10, &[2u8; 10], false);

        assert_eq!(spans(&bufs), vec![(0, 20)]);
        let (slice, _) = bufs.read_at(0).unwrap();
        assert_eq!(&slice[..10], &[1u8; 10]);
        assert_eq!(&slice[10..], &[2u8; 10]);
    }

    #[test]
    fn overlapping_retransmit_collapses() {
        // The overlap scenario: [0,40), [30,70), [60,98) must collapse into
        // a single [0,98) span.
        let mut bufs = RecvBuffers::new();
        bufs.insert(0, &[1u8; 40], false);
        bufs.insert(30, &[2u8; 40], false);
        bufs.insert(60, &[3u8; 38], true);

        assert_eq!(spans(&bufs), vec![(0, 98)]);
        assert_eq!(bufs.fin_offset(), Some(98));

        // Existing bytes won over the retransmit.
        let (slice, fin) = bufs.read_at(0).unwrap();
        assert!(fin);
        assert_eq!(&slice[..40], &[1u8; 40]);
        assert_eq!(&slice[40..70], &[2u8; 30]);
        assert_eq!(&slice[70..], &[3u8; 28]);
    }

    #[test]
    fn bridging_insert_merges_across() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(0, &[1u8; 10], false);
        bufs.insert(20, &[3u8; 10], false);
        bufs.insert(5, &[2u8; 20], false);

        assert_eq!(spans(&bufs), vec![(0, 30)]);
        let (slice, _) = bufs.read_at(0).unwrap();
        assert_eq!(&slice[..10], &[1u8; 10]);
        assert_eq!(&slice[10..20], &[2u8; 10]);
        assert_eq!(&slice[20..], &[3u8; 10]);
    }

    #[test]
    fn total_overlap_is_idempotent() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(0, &[7u8; 50], false);
        bufs.insert(10, &[9u8; 20], false);

        assert_eq!(spans(&bufs), vec![(0, 50)]);
        let (slice, _) = bufs.read_at(0).unwrap();
        assert_eq!(slice, &[7u8; 50]);
    }

    #[test]
    fn read_at_mid_chunk() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(10, b"abcdef", false);

        assert!(bufs.read_at(9).is_none());
        assert_eq!(bufs.read_at(10).unwrap().0, b"abcdef");
        assert_eq!(bufs.read_at(13).unwrap().0, b"def");
        assert!(bufs.read_at(16).is_none());
    }

    #[test]
    fn pop_prefix_suffix_and_split() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(0, &(0..100).collect::<Vec<u8>>(), false);

        bufs.pop(0, 10);
        assert_eq!(spans(&bufs), vec![(10, 100)]);

        bufs.pop(90, 10);
        assert_eq!(spans(&bufs), vec![(10, 90)]);

        bufs.pop(40, 20);
        assert_eq!(spans(&bufs), vec![(10, 40), (60, 90)]);
        assert_eq!(bufs.read_at(60).unwrap().0[0], 60);
    }

    #[test]
    fn pop_across_chunks() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(0, &[1u8; 10], false);
        bufs.insert(20, &[2u8; 10], false);

        bufs.pop(5, 20);
        assert_eq!(spans(&bufs), vec![(0, 5), (25, 30)]);
    }

    #[test]
    fn empty_fin_records_end() {
        let mut bufs = RecvBuffers::new();
        bufs.insert(10, &[], true);
        assert_eq!(bufs.fin_offset(), Some(10));
        assert!(bufs.is_empty());
    }
}
