//! # Call Stacks
//!
//! Capture of return addresses at allocation time and lazy resolution of
//! those addresses into `file(line): function` lines at report time.
//!
//! Capture is cheap: it copies raw instruction pointers into a fixed array
//! and hashes them. Symbol lookup is expensive and only happens through a
//! [`FrameResolver`], normally the process-wide [`SymbolSystem`].

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::clock;
use crate::error::{TrackerError, TrackerResult};

/// Maximum number of frames kept per call stack.
pub const MAX_FRAMES: usize = 128;

/// A captured sequence of return addresses, most recent call first.
#[derive(Clone, PartialEq)]
pub struct CallStack {
    frames: [usize; MAX_FRAMES],
    frame_count: usize,
    hash: u32,
    time: f64,
}

impl CallStack {
    /// Captures the current call stack.
    ///
    /// The frame of `capture` itself is never recorded; `skip` drops that
    /// many additional callers above it.
    #[inline(never)]
    #[must_use]
    pub fn capture(skip: usize) -> Self {
        let marker = Self::capture as *const () as usize;
        let mut frames = [0usize; MAX_FRAMES];
        let mut count = 0;
        let mut past_marker = false;
        let mut to_skip = skip;

        backtrace::trace(|frame| {
            if !past_marker {
                past_marker = frame.symbol_address() as usize == marker;
                return true;
            }
            if to_skip > 0 {
                to_skip -= 1;
                return true;
            }
            frames[count] = frame.ip() as usize;
            count += 1;
            count < MAX_FRAMES
        });

        // Some unwinders never report the function start; keep every frame
        // rather than none.
        if !past_marker {
            count = 0;
            backtrace::trace(|frame| {
                frames[count] = frame.ip() as usize;
                count += 1;
                count < MAX_FRAMES
            });
        }

        Self::with_time(&frames[..count], clock::now_seconds())
    }

    /// Builds a call stack from known return addresses.
    ///
    /// At most [`MAX_FRAMES`] addresses are kept.
    #[must_use]
    pub fn from_frames(addresses: &[usize], time: f64) -> Self {
        Self::with_time(&addresses[..addresses.len().min(MAX_FRAMES)], time)
    }

    fn with_time(addresses: &[usize], time: f64) -> Self {
        let mut frames = [0usize; MAX_FRAMES];
        frames[..addresses.len()].copy_from_slice(addresses);

        let mut hasher = crc32fast::Hasher::new();
        for address in addresses {
            hasher.update(&address.to_ne_bytes());
        }

        Self {
            frames,
            frame_count: addresses.len(),
            hash: hasher.finalize(),
            time,
        }
    }

    /// Captured return addresses, most recent first.
    #[inline]
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.frame_count]
    }

    /// Number of captured frames.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Hash of the frame addresses. Equal stacks always hash equally.
    #[inline]
    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Capture time in seconds, see [`clock::now_seconds`].
    #[inline]
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Resolves up to `max_lines` frames through `resolver`.
    ///
    /// Frames the resolver knows nothing about are skipped, so the result
    /// may be shorter than `max_lines` even when more frames exist.
    pub fn lines<R: FrameResolver + ?Sized>(
        &self,
        resolver: &R,
        max_lines: usize,
    ) -> Vec<CallStackLine> {
        self.frames()
            .iter()
            .take(max_lines)
            .filter_map(|&address| resolver.resolve(address))
            .collect()
    }
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStack")
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("frame_count", &self.frame_count)
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

/// One resolved frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStackLine {
    /// Source file, or `N/A` without line information.
    pub file: String,
    /// Demangled function name.
    pub function: String,
    /// Source line, 0 without line information.
    pub line: u32,
    /// Byte offset of the return address from the symbol start.
    pub offset: u64,
}

impl CallStackLine {
    /// A frame whose symbol is known but whose source location is not.
    #[must_use]
    pub fn without_location(function: impl Into<String>) -> Self {
        Self {
            file: String::from("N/A"),
            function: function.into(),
            line: 0,
            offset: 0,
        }
    }
}

impl fmt::Display for CallStackLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}): {}", self.file, self.line, self.function)
    }
}

/// Turns a return address into a printable line.
pub trait FrameResolver {
    /// Resolves one address, or `None` when no symbol covers it.
    fn resolve(&self, address: usize) -> Option<CallStackLine>;
}

/// Set while a [`SymbolSystem`] is alive.
static SYMBOLS_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Process-wide symbol lookup state.
///
/// Only one may exist at a time. Resolved addresses are cached until the
/// system is dropped, which also releases the debug-info cache.
pub struct SymbolSystem {
    cache: Mutex<HashMap<usize, Option<CallStackLine>>>,
}

impl SymbolSystem {
    /// Brings up symbol lookup.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::SymbolSystemActive`] if another instance is alive.
    pub fn init() -> TrackerResult<Self> {
        if SYMBOLS_ACTIVE.swap(true, Ordering::AcqRel) {
            return Err(TrackerError::SymbolSystemActive);
        }
        info!("Symbol system initialized");
        Ok(Self {
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a symbol system is currently alive.
    #[must_use]
    pub fn is_active() -> bool {
        SYMBOLS_ACTIVE.load(Ordering::Acquire)
    }

    /// Number of addresses resolved so far.
    #[must_use]
    pub fn cached_addresses(&self) -> usize {
        self.cache.lock().len()
    }

    fn lookup(address: usize) -> Option<CallStackLine> {
        let mut resolved = None;
        backtrace::resolve(address as *mut c_void, |symbol| {
            // Inlined frames yield several symbols; the first is innermost.
            if resolved.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            let function = name.to_string();
            resolved = Some(match (symbol.filename(), symbol.lineno()) {
                (Some(file), Some(line)) => CallStackLine {
                    file: file.display().to_string(),
                    function,
                    line,
                    offset: symbol
                        .addr()
                        .map_or(0, |start| (address as u64).saturating_sub(start as u64)),
                },
                _ => CallStackLine::without_location(function),
            });
        });
        resolved
    }
}

impl FrameResolver for SymbolSystem {
    fn resolve(&self, address: usize) -> Option<CallStackLine> {
        if let Some(cached) = self.cache.lock().get(&address) {
            return cached.clone();
        }
        let resolved = Self::lookup(address);
        self.cache.lock().insert(address, resolved.clone());
        resolved
    }
}

impl Drop for SymbolSystem {
    fn drop(&mut self) {
        let cached = self.cache.get_mut().len();
        self.cache.get_mut().clear();
        backtrace::clear_symbol_cache();
        SYMBOLS_ACTIVE.store(false, Ordering::Release);
        info!(cached, "Symbol system shut down");
    }
}

impl fmt::Debug for SymbolSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolSystem")
            .field("cached_addresses", &self.cached_addresses())
            .finish()
    }
}
