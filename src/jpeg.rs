const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// 从 multipart MJPEG 字节流中切出完整的 JPEG 帧
#[derive(Default)]
pub struct FrameExtractor {
    buffer: Vec<u8>,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加数据，返回第一个已完整的帧 (剩余数据保留在缓冲中)
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFER_BYTES {
            let overflow = self.buffer.len() - MAX_BUFFER_BYTES;
            self.buffer.drain(0..overflow);
        }

        let Some(start) = find_marker(&self.buffer, &JPEG_SOI) else {
            // 保留最后一个字节，SOI 可能被切在两个块之间
            let keep_from = self.buffer.len().saturating_sub(1);
            self.buffer.drain(0..keep_from);
            return None;
        };
        if start > 0 {
            self.buffer.drain(0..start);
        }

        let end_rel = find_marker(&self.buffer[2..], &JPEG_EOI)?;
        let end = 2 + end_rel + 2;
        let frame: Vec<u8> = self.buffer.drain(0..end).collect();
        Some(frame)
    }
}

fn find_marker(buffer: &[u8], marker: &[u8; 2]) -> Option<usize> {
    buffer.windows(2).position(|w| w == marker)
}
