//! Output chunking
//!
//! Splits a live output stream into bounded chunks. Concatenating every
//! chunk in order, including the one returned by [`ChunkBuffer::finish`],
//! reproduces the stream byte for byte.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;

/// Flush bounds for a chunk; zero disables a dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Thresholds {
    pub max_lines: usize,
    pub max_elapsed: Duration,
    pub max_bytes: usize,
}

/// Accumulates output and hands out chunks as bounds are reached
#[derive(Debug)]
pub struct ChunkBuffer {
    thresholds: Thresholds,
    buf: BytesMut,
    lines: usize,
    started: Option<Instant>,
}

impl ChunkBuffer {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            buf: BytesMut::new(),
            lines: 0,
            started: None,
        }
    }

    /// Append output, returning every chunk that reached the line or byte bound.
    pub fn push(&mut self, mut data: &[u8], now: Instant) -> Vec<Bytes> {
        let mut ready = Vec::new();

        while !data.is_empty() {
            let mut hold_partial = true;

            // Complete a character whose leading bytes arrived in an earlier push
            let missing = missing_continuation(&self.buf);
            if missing > 0 {
                let n = data
                    .iter()
                    .take(missing)
                    .take_while(|b| is_continuation(**b))
                    .count();
                if n > 0 {
                    let max = self.thresholds.max_bytes;
                    if max > 0 && self.buf.len() + n > max {
                        ready.extend(self.take_chunk(true));
                    }
                    self.append(&data[..n], now);
                    data = &data[n..];
                    if self.bytes_full() {
                        ready.extend(self.take_chunk(true));
                    }
                    continue;
                }
                // the pending sequence can never complete
                hold_partial = false;
            }

            let room = match self.thresholds.max_bytes {
                0 => usize::MAX,
                max => max.saturating_sub(self.buf.len()),
            };

            let mut take = data.len().min(room);
            let mut flush = false;

            if take < data.len() {
                flush = true;
                let boundary = char_boundary(data, take);
                if boundary > 0 || !self.buf.is_empty() {
                    take = boundary;
                }
            }

            if self.thresholds.max_lines > 0 {
                let wanted = self.thresholds.max_lines - self.lines;
                if let Some(pos) = nth_newline(&data[..take], wanted) {
                    take = pos + 1;
                    flush = true;
                }
            }

            if take > 0 {
                let (head, tail) = data.split_at(take);
                self.append(head, now);
                data = tail;
            }

            if flush || self.bytes_full() {
                ready.extend(self.take_chunk(hold_partial));
            }
        }

        ready
    }

    /// When the buffered output must be flushed by the time bound
    pub fn deadline(&self) -> Option<Instant> {
        if self.thresholds.max_elapsed.is_zero() {
            return None;
        }
        self.started.map(|started| started + self.thresholds.max_elapsed)
    }

    /// Flush the buffer if its time bound has passed.
    ///
    /// A trailing partial UTF-8 sequence stays buffered for the next chunk.
    pub fn flush_due(&mut self, now: Instant) -> Option<Bytes> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take_chunk(true),
            _ => None,
        }
    }

    /// Take whatever is left at end of stream
    pub fn finish(&mut self) -> Option<Bytes> {
        self.take_chunk(false)
    }

    fn append(&mut self, bytes: &[u8], now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
        self.lines += count_newlines(bytes);
        self.buf.extend_from_slice(bytes);
    }

    fn bytes_full(&self) -> bool {
        self.thresholds.max_bytes > 0 && self.buf.len() >= self.thresholds.max_bytes
    }

    /// Split off the buffered output, keeping an incomplete trailing
    /// character back when `hold_partial` is set. The time bound restarts
    /// with the next appended byte.
    fn take_chunk(&mut self, hold_partial: bool) -> Option<Bytes> {
        let keep = if hold_partial {
            incomplete_tail(&self.buf)
        } else {
            0
        };
        self.started = None;
        if self.buf.len() == keep {
            return None;
        }
        self.lines = 0;
        Some(self.buf.split_to(self.buf.len() - keep).freeze())
    }
}

/// Largest index `<= idx` that does not split a UTF-8 sequence.
fn char_boundary(data: &[u8], idx: usize) -> usize {
    let mut i = idx;
    while i > 0 && is_continuation(data[i]) {
        i -= 1;
    }
    i
}

fn is_continuation(byte: u8) -> bool {
    (byte & 0xC0) == 0x80
}

/// Encoded length of the sequence `lead` starts; 0 if it cannot start one
fn sequence_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 0,
    }
}

/// Number of trailing bytes that begin a sequence still waiting for continuation bytes
fn incomplete_tail(buf: &[u8]) -> usize {
    let start = buf.len().saturating_sub(3);
    for i in (start..buf.len()).rev() {
        if is_continuation(buf[i]) {
            continue;
        }
        let have = buf.len() - i;
        return if sequence_len(buf[i]) > have { have } else { 0 };
    }
    0
}

fn missing_continuation(buf: &[u8]) -> usize {
    match incomplete_tail(buf) {
        0 => 0,
        tail => sequence_len(buf[buf.len() - tail]) - tail,
    }
}

fn nth_newline(data: &[u8], n: usize) -> Option<usize> {
    data.iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .nth(n.checked_sub(1)?)
        .map(|(pos, _)| pos)
}

fn count_newlines(data: &[u8]) -> usize {
    data.iter().filter(|b| **b == b'\n').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8], thresholds: Thresholds, piece_sizes: &[usize]) -> Vec<Bytes> {
        let mut buffer = ChunkBuffer::new(thresholds);
        let now = Instant::now();
        let mut chunks = Vec::new();
        let mut rest = input;
        let mut sizes = piece_sizes.iter().cycle();
        while !rest.is_empty() {
            let size = (*sizes.next().unwrap()).min(rest.len());
            let (piece, tail) = rest.split_at(size);
            chunks.extend(buffer.push(piece, now));
            rest = tail;
        }
        chunks.extend(buffer.finish());
        chunks
    }

    fn sample_output() -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..40 {
            out.extend_from_slice(
                format!("[{i:02}] Recipe: nginx::default ✓ héllo wörld\n").as_bytes(),
            );
            if i % 7 == 0 {
                out.extend_from_slice(b"  * partial line without newline ");
            }
        }
        out.extend_from_slice("trailing ünterminated".as_bytes());
        out
    }

    #[test]
    fn test_concatenation_reproduces_stream() {
        let input = sample_output();
        let threshold_sets = [
            Thresholds::default(),
            Thresholds { max_lines: 1, ..Thresholds::default() },
            Thresholds { max_lines: 5, ..Thresholds::default() },
            Thresholds { max_bytes: 1, ..Thresholds::default() },
            Thresholds { max_bytes: 17, ..Thresholds::default() },
            Thresholds { max_lines: 3, max_bytes: 64, max_elapsed: Duration::from_secs(1) },
        ];

        for thresholds in threshold_sets {
            for sizes in [&[1usize][..], &[3, 7, 64][..], &[4096][..]] {
                let chunks = run(&input, thresholds, sizes);
                let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
                assert_eq!(joined, input, "thresholds {thresholds:?} sizes {sizes:?}");
                assert!(chunks.iter().all(|c| !c.is_empty()));
                assert!(chunks.iter().all(|c| std::str::from_utf8(c).is_ok()));
                assert!(input.ends_with(&chunks.last().unwrap()[..]));
            }
        }
    }

    #[test]
    fn test_chunks_respect_bounds() {
        let input = sample_output();
        let thresholds = Thresholds {
            max_lines: 4,
            max_bytes: 100,
            max_elapsed: Duration::ZERO,
        };

        for chunk in run(&input, thresholds, &[3, 7, 64]) {
            assert!(chunk.len() <= 100);
            assert!(count_newlines(&chunk) <= 4);
        }
    }

    #[test]
    fn test_line_bound_splits_on_newline() {
        let thresholds = Thresholds { max_lines: 2, ..Thresholds::default() };
        let chunks = run(b"a\nb\nc\nd\ne", thresholds, &[64]);
        assert_eq!(chunks, vec![Bytes::from("a\nb\n"), Bytes::from("c\nd\n"), Bytes::from("e")]);
    }

    #[test]
    fn test_byte_bound_keeps_utf8_intact() {
        let thresholds = Thresholds { max_bytes: 4, ..Thresholds::default() };
        let chunks = run("aaé✓".as_bytes(), thresholds, &[64]);
        for chunk in &chunks {
            assert!(std::str::from_utf8(chunk).is_ok(), "{chunk:?}");
        }
        assert_eq!(chunks, vec![Bytes::from("aaé"), Bytes::from("✓")]);
    }

    fn text(chunks: &[Bytes]) -> String {
        chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    #[test]
    fn test_byte_bound_holds_character_split_across_pushes() {
        let thresholds = Thresholds {
            max_bytes: 4,
            ..Thresholds::default()
        };
        let mut buffer = ChunkBuffer::new(thresholds);
        let now = Instant::now();

        let mut chunks = buffer.push(b"aaa", now);
        chunks.extend(buffer.push(&[0xC3], now));
        chunks.extend(buffer.push(&[0xA9], now));
        chunks.extend(buffer.finish());

        assert_eq!(chunks, vec![Bytes::from("aaa"), Bytes::from("é")]);
        assert_eq!(text(&chunks), "aaaé");
    }

    #[test]
    fn test_time_bound_holds_character_split_across_pushes() {
        let thresholds = Thresholds {
            max_elapsed: Duration::from_secs(1),
            ..Thresholds::default()
        };
        let mut buffer = ChunkBuffer::new(thresholds);
        let t0 = Instant::now();

        assert!(buffer.push(&[b'x', 0xC3], t0).is_empty());
        let mut chunks: Vec<Bytes> = buffer
            .flush_due(t0 + Duration::from_secs(1))
            .into_iter()
            .collect();
        assert!(buffer.deadline().is_none());
        chunks.extend(buffer.push(&[0xA9], t0 + Duration::from_secs(2)));
        chunks.extend(buffer.finish());

        assert_eq!(chunks, vec![Bytes::from("x"), Bytes::from("é")]);
        assert_eq!(text(&chunks), "xé");
    }

    #[test]
    fn test_invalid_lead_byte_is_not_held_forever() {
        let thresholds = Thresholds {
            max_bytes: 1,
            ..Thresholds::default()
        };
        let mut buffer = ChunkBuffer::new(thresholds);
        let now = Instant::now();

        let mut chunks = buffer.push(&[0xC3], now);
        chunks.extend(buffer.push(b"ab", now));
        chunks.extend(buffer.finish());

        assert_eq!(
            chunks,
            vec![Bytes::from_static(&[0xC3]), Bytes::from("a"), Bytes::from("b")]
        );
    }

    #[test]
    fn test_time_bound_flushes_buffer() {
        let thresholds = Thresholds {
            max_elapsed: Duration::from_secs(10),
            ..Thresholds::default()
        };
        let mut buffer = ChunkBuffer::new(thresholds);
        let t0 = Instant::now();

        assert!(buffer.push(b"starting run\n", t0).is_empty());
        assert_eq!(buffer.deadline(), Some(t0 + Duration::from_secs(10)));
        assert!(buffer.flush_due(t0 + Duration::from_secs(5)).is_none());
        assert_eq!(
            buffer.flush_due(t0 + Duration::from_secs(10)),
            Some(Bytes::from("starting run\n"))
        );
        assert!(buffer.deadline().is_none());
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_zero_thresholds_buffer_everything() {
        let chunks = run(b"one\ntwo\nthree\n", Thresholds::default(), &[2]);
        assert_eq!(chunks, vec![Bytes::from("one\ntwo\nthree\n")]);
    }
}
