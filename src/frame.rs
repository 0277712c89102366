//! Frame value type and JPEG boundary scanning.
//!
//! The decode process emits a continuous MJPEG byte stream; `FrameAssembler`
//! splits it into complete JPEG images on the SOI/EOI markers. A partial
//! image split across reads is retained and completed on the next read. A
//! buffer that grows past a fixed ceiling without a boundary indicates stream
//! corruption and triggers a reset: data loss is acceptable, availability is
//! not negotiable.

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Ceiling for the scan buffer; past this without a boundary we reset.
pub const MAX_SCAN_BUFFER: usize = 8 * 1024 * 1024;

/// One decoded image. Immutable after creation; carries everything downstream
/// consumers need, with no out-of-band state.
#[derive(Clone, Debug)]
pub struct Frame {
    pub camera: String,
    pub payload: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Strictly increasing per camera.
    pub seq: u64,
    /// Capture timestamp, milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
}

/// Incremental JPEG extractor over arbitrary read chunks.
pub struct FrameAssembler {
    buf: Vec<u8>,
    max_buffer: usize,
    resets: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_ceiling(MAX_SCAN_BUFFER)
    }

    pub fn with_ceiling(max_buffer: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_buffer,
            resets: 0,
        }
    }

    /// Feed a chunk of bytes; returns every complete JPEG payload found, in
    /// stream order. Never returns a partial image.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, &JPEG_SOI) else {
                // No start marker: everything buffered is garbage, except a
                // trailing 0xFF that may be half of the next marker.
                let keep_tail = self.buf.last() == Some(&0xFF);
                let tail = if keep_tail { vec![0xFF] } else { Vec::new() };
                self.buf = tail;
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            match find_marker(&self.buf[2..], &JPEG_EOI) {
                Some(rel_end) => {
                    let end = 2 + rel_end + JPEG_EOI.len();
                    let frame = self.buf[..end].to_vec();
                    self.buf.drain(..end);
                    frames.push(frame);
                }
                None => {
                    if self.buf.len() > self.max_buffer {
                        log::warn!(
                            "frame scan buffer exceeded {} bytes without a boundary, resetting",
                            self.max_buffer
                        );
                        self.buf.clear();
                        self.resets += 1;
                    }
                    break;
                }
            }
        }

        frames
    }

    /// Number of corruption resets since creation.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Bytes currently held for an incomplete image.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|window| window == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut image = JPEG_SOI.to_vec();
        image.extend_from_slice(body);
        image.extend_from_slice(&JPEG_EOI);
        image
    }

    #[test]
    fn extracts_single_image() {
        let mut asm = FrameAssembler::new();
        let image = jpeg(b"pixels");
        let frames = asm.push(&image);
        assert_eq!(frames, vec![image]);
        assert_eq!(asm.pending_bytes(), 0);
    }

    #[test]
    fn extracts_all_images_for_any_chunking() {
        let images: Vec<Vec<u8>> = (0..5u8)
            .map(|i| jpeg(&[i, i.wrapping_add(1), 0x00, i]))
            .collect();
        let stream: Vec<u8> = images.iter().flatten().copied().collect();

        for chunk_size in [1, 2, 3, 5, 7, 16, stream.len()] {
            let mut asm = FrameAssembler::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                got.extend(asm.push(chunk));
            }
            assert_eq!(got, images, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn partial_image_completed_on_next_read() {
        let image = jpeg(b"split across reads");
        let (a, b) = image.split_at(7);

        let mut asm = FrameAssembler::new();
        assert!(asm.push(a).is_empty());
        assert_eq!(asm.push(b), vec![image]);
    }

    #[test]
    fn garbage_before_start_marker_is_discarded() {
        let image = jpeg(b"x");
        let mut stream = vec![0x00, 0x01, 0x02, 0xFF, 0x00];
        stream.extend_from_slice(&image);

        let mut asm = FrameAssembler::new();
        assert_eq!(asm.push(&stream), vec![image]);
    }

    #[test]
    fn trailing_ff_is_retained_as_possible_marker_half() {
        let image = jpeg(b"y");
        let mut asm = FrameAssembler::new();
        // 0xFF is the first byte of SOI, delivered at a chunk boundary.
        assert!(asm.push(&[0x00, 0xFF]).is_empty());
        assert_eq!(asm.push(&image[1..]), vec![image]);
    }

    #[test]
    fn oversized_buffer_resets() {
        let mut asm = FrameAssembler::with_ceiling(64);
        let mut unterminated = JPEG_SOI.to_vec();
        unterminated.extend(std::iter::repeat(0x00).take(200));

        assert!(asm.push(&unterminated).is_empty());
        assert_eq!(asm.resets(), 1);
        assert_eq!(asm.pending_bytes(), 0);

        // The stream recovers on the next complete image.
        let image = jpeg(b"recovered");
        assert_eq!(asm.push(&image), vec![image]);
    }
}
