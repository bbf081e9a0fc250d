// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, io,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use calloop::ping::Ping;
use smithay::backend::allocator::dmabuf::Dmabuf;
use tracing::{info, warn};

pub mod pattern;
pub mod y4m;

/// Consecutive "not ready" polls after which a decoder is considered stuck.
pub const MAX_NOT_READY_POLLS: u32 = 500;

/// Pixel data of a decoded frame.
pub enum FramePayload {
    /// XRGB8888 pixels in system memory, uploaded into a texture by the compositor.
    Pixels(Vec<u32>),
    /// An external memory buffer imported without copying.
    External(Dmabuf),
}

impl fmt::Debug for FramePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramePayload::Pixels(pixels) => f.debug_tuple("Pixels").field(&pixels.len()).finish(),
            FramePayload::External(_) => f.debug_tuple("External").finish(),
        }
    }
}

/// A frame lent out by a decoder. It has to be handed back with [`Decoder::return_frame`].
#[derive(Debug)]
pub struct DecodedFrame {
    /// Index of the frame within the stream.
    pub seq: u64,
    pub pts: Duration,
    pub width: u32,
    pub height: u32,
    /// Row 0 holds the bottom of the picture.
    pub flipped: bool,
    pub payload: FramePayload,
}

impl DecodedFrame {
    pub fn pixels(&self) -> Option<&[u32]> {
        match &self.payload {
            FramePayload::Pixels(pixels) => Some(pixels),
            FramePayload::External(_) => None,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.payload, FramePayload::External(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unsupported stream: {0}")]
    Unsupported(String),
    #[error("no input file given")]
    NoInput,
    #[error("decoder failed: {0}")]
    Fatal(String),
    #[error("all decoders failed")]
    Exhausted,
}

/// The boundary every decoder implementation is driven through.
///
/// All methods are non-blocking; decoders doing real work do it on their own thread.
pub trait Decoder {
    fn name(&self) -> &'static str;
    /// The next frame, or `None` if none is ready yet.
    fn try_get_next_frame(&mut self) -> Option<DecodedFrame>;
    fn return_frame(&mut self, frame: DecodedFrame);
    fn is_eof(&self) -> bool;
    fn is_fatal_error(&self) -> bool;
    /// Seeks back to the first frame.
    fn rewind(&mut self) -> Result<(), DecoderError>;
    /// Drops queued frames and error state after a stall.
    fn reset(&mut self) -> Result<(), DecoderError>;
    fn set_queue_depth(&mut self, depth: usize);
    /// Whether frames decoded from now on should be stored bottom row first.
    fn set_flip_y(&mut self, flip: bool);
}

/// The single "a new frame may be ready" signal shared with decoder integrations.
#[derive(Clone)]
pub struct WakeupFlag {
    dirty: Arc<AtomicBool>,
    ping: Option<Ping>,
}

impl fmt::Debug for WakeupFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeupFlag")
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for WakeupFlag {
    fn default() -> Self {
        WakeupFlag {
            dirty: Arc::new(AtomicBool::new(false)),
            ping: None,
        }
    }
}

impl WakeupFlag {
    /// A flag that also wakes up the event loop `ping` belongs to.
    pub fn with_ping(ping: Ping) -> Self {
        WakeupFlag {
            ping: Some(ping),
            ..Default::default()
        }
    }

    pub fn raise(&self) {
        self.dirty.store(true, Ordering::Release);
        if let Some(ping) = self.ping.as_ref() {
            ping.ping();
        }
    }

    pub fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Y4m,
    Pattern,
}

impl FromStr for DecoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "y4m" | "software" => Ok(DecoderKind::Y4m),
            "pattern" | "test" => Ok(DecoderKind::Pattern),
            x => Err(format!("Unknown decoder '{}'", x)),
        }
    }
}

impl DecoderKind {
    /// Whether the decoder reads from an input file.
    pub fn needs_input(self) -> bool {
        matches!(self, DecoderKind::Y4m)
    }

    pub fn parse_list(list: &str) -> Vec<DecoderKind> {
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| match s.parse() {
                Ok(kind) => Some(kind),
                Err(err) => {
                    warn!("{}", err);
                    None
                }
            })
            .collect()
    }

    pub fn open(
        self,
        input: Option<&std::path::Path>,
        size: (u32, u32),
        wakeup: WakeupFlag,
    ) -> Result<Box<dyn Decoder>, DecoderError> {
        match self {
            DecoderKind::Y4m => {
                let path = input.ok_or(DecoderError::NoInput)?;
                Ok(Box::new(y4m::Y4mDecoder::open(path, wakeup)?))
            }
            DecoderKind::Pattern => Ok(Box::new(pattern::PatternDecoder::new(
                size.0,
                size.1,
                pattern::DEFAULT_FPS,
            ))),
        }
    }
}

pub type OpenDecoder = Box<dyn FnMut() -> Result<Box<dyn Decoder>, DecoderError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderState {
    /// Backend `i` is running but has not produced a frame yet.
    Trying(usize),
    /// Backend `i` produced at least one frame.
    Committed(usize),
    Exhausted,
}

/// Ordered list of decoder backends with a single fallback transition.
pub struct DecoderLadder {
    backends: Vec<(String, OpenDecoder)>,
    state: LadderState,
    current: Option<Box<dyn Decoder>>,
    not_ready: u32,
    max_not_ready: u32,
}

impl fmt::Debug for DecoderLadder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderLadder")
            .field(
                "backends",
                &self.backends.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("state", &self.state)
            .field("not_ready", &self.not_ready)
            .finish()
    }
}

impl DecoderLadder {
    pub fn new(backends: Vec<(String, OpenDecoder)>) -> Self {
        DecoderLadder {
            backends,
            state: LadderState::Trying(0),
            current: None,
            not_ready: 0,
            max_not_ready: MAX_NOT_READY_POLLS,
        }
    }

    /// Opens the decoders of `kinds` in order, all sharing `wakeup`.
    pub fn from_kinds(
        kinds: &[DecoderKind],
        input: Option<PathBuf>,
        size: (u32, u32),
        wakeup: &WakeupFlag,
    ) -> Self {
        let backends = kinds
            .iter()
            .map(|&kind| {
                let input = input.clone();
                let wakeup = wakeup.clone();
                let open: OpenDecoder = Box::new(move || kind.open(input.as_deref(), size, wakeup.clone()));
                (format!("{:?}", kind).to_lowercase(), open)
            })
            .collect();
        DecoderLadder::new(backends)
    }

    pub fn with_max_not_ready(mut self, polls: u32) -> Self {
        self.max_not_ready = polls;
        self
    }

    pub fn state(&self) -> LadderState {
        self.state
    }

    pub fn current_name(&self) -> Option<&str> {
        match self.state {
            LadderState::Trying(i) | LadderState::Committed(i) => {
                self.backends.get(i).map(|(name, _)| name.as_str())
            }
            LadderState::Exhausted => None,
        }
    }

    /// Opens the first backend that can be opened.
    pub fn start(&mut self) -> Result<(), DecoderError> {
        self.state = LadderState::Trying(0);
        self.open_current()
    }

    fn open_current(&mut self) -> Result<(), DecoderError> {
        let count = self.backends.len();
        loop {
            let LadderState::Trying(index) = self.state else {
                return Err(DecoderError::Exhausted);
            };
            let Some((name, open)) = self.backends.get_mut(index) else {
                self.state = LadderState::Exhausted;
                return Err(DecoderError::Exhausted);
            };
            match open() {
                Ok(decoder) => {
                    info!(decoder = %name, "Using decoder.");
                    self.current = Some(decoder);
                    self.not_ready = 0;
                    return Ok(());
                }
                Err(err) => {
                    warn!(?err, decoder = %name, "Failed to open decoder.");
                    self.state = if index + 1 < count {
                        LadderState::Trying(index + 1)
                    } else {
                        LadderState::Exhausted
                    };
                }
            }
        }
    }

    pub fn current(&mut self) -> Option<&mut (dyn Decoder + 'static)> {
        self.current.as_deref_mut()
    }

    /// Records a successfully decoded frame.
    pub fn frame_received(&mut self) {
        self.not_ready = 0;
        if let LadderState::Trying(index) = self.state {
            self.state = LadderState::Committed(index);
        }
    }

    /// Records a poll without a frame, returning `true` once the decoder counts as stuck.
    pub fn frame_not_ready(&mut self) -> bool {
        self.not_ready = self.not_ready.saturating_add(1);
        self.not_ready > self.max_not_ready
    }

    /// Abandons the current backend for the next one in line.
    pub fn fall_back(&mut self, reason: &str) -> Result<(), DecoderError> {
        let next = match self.state {
            LadderState::Trying(i) | LadderState::Committed(i) => i + 1,
            LadderState::Exhausted => return Err(DecoderError::Exhausted),
        };
        warn!(
            reason,
            from = self.current_name().unwrap_or("none"),
            "Falling back to the next decoder."
        );
        self.current = None;
        if next >= self.backends.len() {
            self.state = LadderState::Exhausted;
            return Err(DecoderError::Exhausted);
        }
        self.state = LadderState::Trying(next);
        self.open_current()
    }
}
