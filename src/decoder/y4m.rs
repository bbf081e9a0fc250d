// SPDX-License-Identifier: GPL-3.0-only

//! Software decoding of uncompressed YUV4MPEG2 streams.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::{DecodedFrame, Decoder, DecoderError, FramePayload, WakeupFlag};

const MAGIC: &str = "YUV4MPEG2";
const MAX_HEADER_LEN: usize = 1024;
pub const MAX_DIMENSION: u32 = 16384;
/// Frames the renderer may hold on top of the decode-ahead queue.
const RENDERER_HELD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
}

impl StreamInfo {
    pub fn pts(&self, seq: u64) -> Duration {
        Duration::from_secs_f64(seq as f64 * self.fps_den as f64 / self.fps_num as f64)
    }

    /// Bytes of one raw I420 frame, `None` if it does not fit in memory at all.
    fn frame_bytes(&self) -> Option<usize> {
        let luma = (self.width as usize).checked_mul(self.height as usize)?;
        let chroma = (self.width.div_ceil(2) as usize).checked_mul(self.height.div_ceil(2) as usize)?;
        luma.checked_add(chroma.checked_mul(2)?)
    }

    fn plane_sizes(&self) -> (usize, usize) {
        let luma = self.width as usize * self.height as usize;
        let chroma = self.width.div_ceil(2) as usize * self.height.div_ceil(2) as usize;
        (luma, chroma)
    }
}

/// Parses the stream header line (without the trailing newline).
pub fn parse_header(line: &str) -> Result<StreamInfo, DecoderError> {
    let mut tokens = line.split_ascii_whitespace();
    if tokens.next() != Some(MAGIC) {
        return Err(DecoderError::Unsupported("missing YUV4MPEG2 signature".into()));
    }

    let mut width = None;
    let mut height = None;
    let mut rate = (25, 1);
    for token in tokens {
        let (tag, value) = token.split_at(token.chars().next().map_or(0, char::len_utf8));
        match tag {
            "W" => width = value.parse::<u32>().ok(),
            "H" => height = value.parse::<u32>().ok(),
            "F" => {
                let (num, den) = value
                    .split_once(':')
                    .ok_or_else(|| DecoderError::Unsupported(format!("bad frame rate {}", value)))?;
                rate = (
                    num.parse().unwrap_or(0),
                    den.parse().unwrap_or(0),
                );
            }
            "C" => {
                if !value.starts_with("420") {
                    return Err(DecoderError::Unsupported(format!("chroma {}", value)));
                }
            }
            "I" => {
                if value != "p" && value != "?" {
                    return Err(DecoderError::Unsupported(format!("interlacing {}", value)));
                }
            }
            _ => {}
        }
    }

    let info = match (width, height, rate) {
        (Some(width), Some(height), (fps_num, fps_den))
            if width > 0 && height > 0 && fps_num > 0 && fps_den > 0 =>
        {
            StreamInfo {
                width,
                height,
                fps_num,
                fps_den,
            }
        }
        _ => return Err(DecoderError::Unsupported(format!("invalid header '{}'", line))),
    };
    if info.width > MAX_DIMENSION || info.height > MAX_DIMENSION || info.frame_bytes().is_none() {
        return Err(DecoderError::Unsupported(format!(
            "frame size {}x{} exceeds {}x{}",
            info.width, info.height, MAX_DIMENSION, MAX_DIMENSION
        )));
    }
    Ok(info)
}

/// BT.601 limited range I420 to XRGB8888.
pub fn convert_i420(
    info: &StreamInfo,
    y_plane: &[u8],
    u_plane: &[u8],
    v_plane: &[u8],
    flip_y: bool,
    out: &mut [u32],
) {
    let (w, h) = (info.width as usize, info.height as usize);
    let chroma_w = w.div_ceil(2);
    for row in 0..h {
        let out_row = if flip_y { h - 1 - row } else { row };
        let out = &mut out[out_row * w..(out_row + 1) * w];
        let luma = &y_plane[row * w..(row + 1) * w];
        let chroma_row = (row / 2) * chroma_w;
        for (col, pixel) in out.iter_mut().enumerate() {
            let y = luma[col] as i32 - 16;
            let u = u_plane[chroma_row + col / 2] as i32 - 128;
            let v = v_plane[chroma_row + col / 2] as i32 - 128;
            let c = 298 * y;
            let r = ((c + 409 * v + 128) >> 8).clamp(0, 255) as u32;
            let g = ((c - 100 * u - 208 * v + 128) >> 8).clamp(0, 255) as u32;
            let b = ((c + 516 * u + 128) >> 8).clamp(0, 255) as u32;
            *pixel = r << 16 | g << 8 | b;
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    free: Vec<Vec<u32>>,
    ready: VecDeque<DecodedFrame>,
    allocated: usize,
    depth: usize,
    flip_y: bool,

    eof: bool,
    error: Option<String>,
    rewind: bool,
    stop: bool,
}

impl Queue {
    fn capacity(&self) -> usize {
        self.depth + RENDERER_HELD
    }

    fn recycle_ready(&mut self) {
        for frame in self.ready.drain(..) {
            if let FramePayload::Pixels(pixels) = frame.payload {
                self.free.push(pixels);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

pub struct Y4mDecoder {
    info: StreamInfo,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Y4mDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Y4mDecoder").field("info", &self.info).finish_non_exhaustive()
    }
}

impl Y4mDecoder {
    pub fn open(path: &Path, wakeup: WakeupFlag) -> Result<Self, DecoderError> {
        let open_err = |source| DecoderError::Open {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = BufReader::new(File::open(path).map_err(open_err)?);
        let header = read_line(&mut reader).map_err(open_err)?;
        let info = parse_header(&header)?;
        let data_start = reader.stream_position().map_err(open_err)?;
        info!(
            ?path,
            width = info.width,
            height = info.height,
            fps = info.fps_num as f64 / info.fps_den as f64,
            "Opened Y4M stream."
        );

        let shared = Arc::new(Shared::default());
        shared.queue.lock().depth = 3;
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("y4m-decoder".into())
                .spawn(move || {
                    let mut worker = Worker {
                        info,
                        reader,
                        data_start,
                        seq: 0,
                        shared,
                        wakeup,
                    };
                    worker.run();
                })
                .map_err(|err| DecoderError::Fatal(err.to_string()))?
        };

        Ok(Y4mDecoder {
            info,
            shared,
            worker: Some(worker),
        })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }
}

impl Decoder for Y4mDecoder {
    fn name(&self) -> &'static str {
        "y4m"
    }

    fn try_get_next_frame(&mut self) -> Option<DecodedFrame> {
        self.shared.queue.lock().ready.pop_front()
    }

    fn return_frame(&mut self, frame: DecodedFrame) {
        if let FramePayload::Pixels(pixels) = frame.payload {
            self.shared.queue.lock().free.push(pixels);
            self.shared.cond.notify_all();
        }
    }

    fn is_eof(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.eof && queue.ready.is_empty() && !queue.rewind
    }

    fn is_fatal_error(&self) -> bool {
        self.shared.queue.lock().error.is_some()
    }

    fn rewind(&mut self) -> Result<(), DecoderError> {
        let mut queue = self.shared.queue.lock();
        if let Some(err) = queue.error.as_ref() {
            return Err(DecoderError::Fatal(err.clone()));
        }
        queue.recycle_ready();
        queue.rewind = true;
        queue.eof = false;
        self.shared.cond.notify_all();
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DecoderError> {
        let mut queue = self.shared.queue.lock();
        debug!(queued = queue.ready.len(), "Resetting decoder queue.");
        queue.recycle_ready();
        self.shared.cond.notify_all();
        match queue.error.as_ref() {
            Some(err) => Err(DecoderError::Fatal(err.clone())),
            None => Ok(()),
        }
    }

    fn set_queue_depth(&mut self, depth: usize) {
        let mut queue = self.shared.queue.lock();
        if queue.depth != depth {
            debug!(depth, "Decoder queue depth changed.");
            queue.depth = depth.max(1);
            self.shared.cond.notify_all();
        }
    }

    fn set_flip_y(&mut self, flip: bool) {
        self.shared.queue.lock().flip_y = flip;
    }
}

impl Drop for Y4mDecoder {
    fn drop(&mut self) {
        self.shared.queue.lock().stop = true;
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Decoder thread panicked.");
            }
        }
    }
}

fn read_line(reader: &mut impl BufRead) -> io::Result<String> {
    let mut line = Vec::new();
    reader
        .by_ref()
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', &mut line)?;
    if line.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated header line",
        ));
    }
    line.pop();
    String::from_utf8(line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

struct Worker {
    info: StreamInfo,
    reader: BufReader<File>,
    data_start: u64,
    seq: u64,
    shared: Arc<Shared>,
    wakeup: WakeupFlag,
}

enum Next {
    Buffer(Vec<u32>, bool),
    Rewind,
    Stop,
}

impl Worker {
    fn run(&mut self) {
        let (luma, chroma) = self.info.plane_sizes();
        let mut planes = vec![0u8; luma + 2 * chroma];
        loop {
            let (mut pixels, flip_y) = match self.wait_for_work() {
                Next::Buffer(pixels, flip_y) => (pixels, flip_y),
                Next::Rewind => {
                    if let Err(err) = self.reader.seek(SeekFrom::Start(self.data_start)) {
                        self.fail(format!("failed to rewind: {}", err));
                    }
                    self.seq = 0;
                    continue;
                }
                Next::Stop => return,
            };

            match self.read_frame(&mut planes) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(frames = self.seq, "End of stream.");
                    let mut queue = self.shared.queue.lock();
                    queue.free.push(pixels);
                    queue.eof = true;
                    drop(queue);
                    self.wakeup.raise();
                    continue;
                }
                Err(err) => {
                    self.shared.queue.lock().free.push(pixels);
                    self.fail(err.to_string());
                    continue;
                }
            }

            let len = self.info.width as usize * self.info.height as usize;
            pixels.resize(len, 0);
            let (y, rest) = planes.split_at(luma);
            let (u, v) = rest.split_at(chroma);
            convert_i420(&self.info, y, u, v, flip_y, &mut pixels);

            let frame = DecodedFrame {
                seq: self.seq,
                pts: self.info.pts(self.seq),
                width: self.info.width,
                height: self.info.height,
                flipped: flip_y,
                payload: FramePayload::Pixels(pixels),
            };
            self.seq += 1;

            let mut queue = self.shared.queue.lock();
            if queue.rewind {
                // decoded before the rewind request, discard
                if let FramePayload::Pixels(pixels) = frame.payload {
                    queue.free.push(pixels);
                }
                continue;
            }
            queue.ready.push_back(frame);
            drop(queue);
            self.wakeup.raise();
        }
    }

    fn wait_for_work(&self) -> Next {
        let mut queue = self.shared.queue.lock();
        loop {
            if queue.stop {
                return Next::Stop;
            }
            if queue.rewind {
                queue.rewind = false;
                return Next::Rewind;
            }
            if !queue.eof && queue.error.is_none() && queue.ready.len() < queue.depth {
                if let Some(pixels) = queue.free.pop() {
                    return Next::Buffer(pixels, queue.flip_y);
                }
                if queue.allocated < queue.capacity() {
                    queue.allocated += 1;
                    return Next::Buffer(Vec::new(), queue.flip_y);
                }
            }
            self.shared.cond.wait(&mut queue);
        }
    }

    /// Reads the next frame into `planes`, returning `false` at the end of the stream.
    fn read_frame(&mut self, planes: &mut [u8]) -> io::Result<bool> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(false);
        }
        let header = read_line(&mut self.reader)?;
        if !header.starts_with("FRAME") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected FRAME, got '{}'", header),
            ));
        }
        match self.reader.read_exact(planes) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(frame = self.seq, "Truncated last frame.");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn fail(&self, err: String) {
        error!(%err, "Decoder failed.");
        self.shared.queue.lock().error = Some(err);
        self.wakeup.raise();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{io::Write, time::Instant};

    fn write_stream(name: &str, frames: usize) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("warpplay-{}-{}.y4m", name, std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "YUV4MPEG2 W4 H2 F30:1 Ip A1:1 C420jpeg").unwrap();
        for i in 0..frames {
            writeln!(file, "FRAME").unwrap();
            // luma ramps with the frame index, neutral chroma
            file.write_all(&[16 + i as u8; 8]).unwrap();
            file.write_all(&[128; 4]).unwrap();
        }
        path
    }

    fn next_frame(decoder: &mut Y4mDecoder) -> Option<DecodedFrame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(frame) = decoder.try_get_next_frame() {
                return Some(frame);
            }
            if decoder.is_eof() {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn parses_headers() {
        let info = parse_header("YUV4MPEG2 W1280 H720 F30000:1001 Ip A1:1 C420mpeg2").unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!((info.fps_num, info.fps_den), (30000, 1001));
        assert!(parse_header("YUV4MPEG2 W1280 H720 C444").is_err());
        assert!(parse_header("RIFF W1280 H720").is_err());
        assert!(parse_header("YUV4MPEG2 W0 H720").is_err());
    }

    #[test]
    fn rejects_oversized_frames() {
        assert!(parse_header("YUV4MPEG2 W16384 H16384 F25:1").is_ok());
        assert!(matches!(
            parse_header("YUV4MPEG2 W100000 H100000 F25:1"),
            Err(DecoderError::Unsupported(_))
        ));
        assert!(parse_header("YUV4MPEG2 W16385 H2 F25:1").is_err());
        assert!(parse_header("YUV4MPEG2 W2 H4294967295 F25:1").is_err());

        let path = std::env::temp_dir().join(format!("warpplay-huge-{}.y4m", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "YUV4MPEG2 W100000 H100000 F30:1 Ip C420jpeg").unwrap();
        writeln!(file, "FRAME").unwrap();
        drop(file);
        assert!(matches!(
            Y4mDecoder::open(&path, WakeupFlag::default()),
            Err(DecoderError::Unsupported(_))
        ));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn converts_limited_range() {
        let info = StreamInfo {
            width: 2,
            height: 2,
            fps_num: 25,
            fps_den: 1,
        };
        let mut out = [0u32; 4];
        convert_i420(&info, &[235, 235, 16, 16], &[128], &[128], false, &mut out);
        assert_eq!(out, [0x00ff_ffff, 0x00ff_ffff, 0, 0]);
        convert_i420(&info, &[235, 235, 16, 16], &[128], &[128], true, &mut out);
        assert_eq!(out, [0, 0, 0x00ff_ffff, 0x00ff_ffff]);
    }

    #[test]
    fn decodes_and_loops() {
        let path = write_stream("loop", 3);
        let mut decoder = Y4mDecoder::open(&path, WakeupFlag::default()).unwrap();

        let mut seqs = Vec::new();
        while let Some(frame) = next_frame(&mut decoder) {
            seqs.push(frame.seq);
            assert_eq!(frame.pts, decoder.info().pts(frame.seq));
            decoder.return_frame(frame);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(decoder.is_eof());

        decoder.rewind().unwrap();
        assert!(!decoder.is_eof());
        let frame = next_frame(&mut decoder).unwrap();
        assert_eq!(frame.seq, 0);
        decoder.return_frame(frame);

        drop(decoder);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_fails_to_open() {
        let path = std::env::temp_dir().join("warpplay-definitely-missing.y4m");
        assert!(matches!(
            Y4mDecoder::open(&path, WakeupFlag::default()),
            Err(DecoderError::Open { .. })
        ));
    }
}
