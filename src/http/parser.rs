//! Incremental, callback driven HTTP/1.x request parser.
//!
//! Bytes are fed in whatever pieces the socket hands out. The request head is
//! buffered and handed to `httparse` only when it can decide: on the first
//! bytes, once a blank line has arrived, or once the head is too large. Body framing
//! (`Content-Length` or chunked) is tracked byte by byte. Events are reported
//! through a [`Settings`] table of plain function pointers, so one immutable
//! table can serve every connection.

use thiserror::Error;

/// Most headers accepted in one request head.
pub const MAX_HEADERS: usize = 64;

/// Largest request head (request line plus headers) accepted.
pub const MAX_HEAD_SIZE: usize = 80 * 1024;

/// Largest chunk-size line, extensions included.
pub const MAX_CHUNK_LINE: usize = 1024;

/// Largest trailer section after the last chunk.
pub const MAX_TRAILERS_SIZE: usize = 80 * 1024;

/// Returned by callbacks to steer the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,

    /// Finish the current event, then consume nothing more
    Pause,

    /// Stop with [`ParseError::Aborted`]
    Abort,
}

pub type Notify<T> = fn(&mut T) -> Control;
pub type Data<T> = fn(&mut T, &[u8]) -> Control;
pub type Header<T> = fn(&mut T, &str, &[u8]) -> Control;

/// Callback table consulted by [`Parser::execute`].
///
/// Unset entries are no-ops.
pub struct Settings<T> {
    pub on_message_begin: Option<Notify<T>>,
    pub on_url: Option<Data<T>>,
    pub on_header: Option<Header<T>>,
    pub on_headers_complete: Option<Notify<T>>,
    pub on_body: Option<Data<T>>,
    pub on_message_complete: Option<Notify<T>>,
}

impl<T> Settings<T> {
    pub const fn new() -> Settings<T> {
        Settings {
            on_message_begin: None,
            on_url: None,
            on_header: None,
            on_headers_complete: None,
            on_body: None,
            on_message_complete: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request head: {0}")]
    Head(#[from] httparse::Error),

    #[error("request head larger than {} bytes", MAX_HEAD_SIZE)]
    HeadTooLarge,

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("invalid chunk size line")]
    InvalidChunkSize,

    #[error("chunk data not followed by CRLF")]
    InvalidChunkTerminator,

    #[error("trailers larger than {} bytes", MAX_TRAILERS_SIZE)]
    TrailersTooLarge,

    #[error("{event} callback aborted the parse")]
    Aborted { event: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd { cr: bool },
    Trailers,
}

enum Framing {
    None,
    Length(u64),
    Chunked,
}

/// Per-connection parser state.
pub struct Parser {
    phase: Phase,

    /// Request head bytes seen so far
    head: Vec<u8>,

    /// Partial chunk-size or trailer line
    line: Vec<u8>,

    /// Trailer bytes seen for the current message
    trailers: usize,

    /// Set once, after which nothing more is parsed
    error: Option<ParseError>,

    /// A callback asked to stop
    paused: bool,

    #[cfg(test)]
    head_parses: usize,
}

impl Parser {
    /// A fresh parser expecting a request.
    pub fn request() -> Parser {
        Parser {
            phase: Phase::Head,
            head: Vec::new(),
            line: Vec::new(),
            trailers: 0,
            error: None,
            paused: false,
            #[cfg(test)]
            head_parses: 0,
        }
    }

    /// Feed `data` to the parser and return how many bytes were consumed.
    ///
    /// Less than `data.len()` is consumed when the parse fails or a callback
    /// returns [`Control::Pause`]. Either way every later call consumes
    /// nothing; a failure is kept in [`Parser::error`]. After a message
    /// completes the parser expects the next one.
    pub fn execute<T>(&mut self, settings: &Settings<T>, ctx: &mut T, data: &[u8]) -> usize {
        if self.error.is_some() || self.paused {
            return 0;
        }

        let mut pos = 0;

        while pos < data.len() && !self.paused {
            match self.step(settings, ctx, &data[pos..]) {
                Ok(n) => pos += n,
                Err(err) => {
                    self.error = Some(err);
                    return pos;
                }
            }
        }

        pos
    }

    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    /// Consume at least one byte of the non-empty `rest`.
    fn step<T>(
        &mut self,
        settings: &Settings<T>,
        ctx: &mut T,
        rest: &[u8],
    ) -> Result<usize, ParseError> {
        match self.phase {
            Phase::Head => self.parse_head(settings, ctx, rest),
            Phase::Body { remaining } => {
                let n = (rest.len() as u64).min(remaining) as usize;
                notify_data(settings.on_body, ctx, &rest[..n], "on_body", &mut self.paused)?;

                if remaining == n as u64 {
                    self.complete(settings, ctx)?;
                } else {
                    self.phase = Phase::Body {
                        remaining: remaining - n as u64,
                    };
                }
                Ok(n)
            }
            Phase::ChunkSize => {
                let Some(i) = rest.iter().position(|&b| b == b'\n') else {
                    self.buffer_line(rest, MAX_CHUNK_LINE, ParseError::InvalidChunkSize)?;
                    return Ok(rest.len());
                };

                self.buffer_line(&rest[..i], MAX_CHUNK_LINE, ParseError::InvalidChunkSize)?;
                let size = chunk_size(&self.line)?;
                self.line.clear();

                self.phase = if size == 0 {
                    self.trailers = 0;
                    Phase::Trailers
                } else {
                    Phase::ChunkData { remaining: size }
                };
                Ok(i + 1)
            }
            Phase::ChunkData { remaining } => {
                let n = (rest.len() as u64).min(remaining) as usize;
                notify_data(settings.on_body, ctx, &rest[..n], "on_body", &mut self.paused)?;

                self.phase = if remaining == n as u64 {
                    Phase::ChunkEnd { cr: false }
                } else {
                    Phase::ChunkData {
                        remaining: remaining - n as u64,
                    }
                };
                Ok(n)
            }
            Phase::ChunkEnd { cr } => {
                match rest[0] {
                    b'\r' if !cr => self.phase = Phase::ChunkEnd { cr: true },
                    b'\n' => self.phase = Phase::ChunkSize,
                    _ => return Err(ParseError::InvalidChunkTerminator),
                }
                Ok(1)
            }
            Phase::Trailers => {
                let end = rest.iter().position(|&b| b == b'\n');
                let taken = end.map_or(rest.len(), |i| i + 1);

                self.trailers += taken;
                if self.trailers > MAX_TRAILERS_SIZE {
                    return Err(ParseError::TrailersTooLarge);
                }

                let Some(i) = end else {
                    self.line.extend_from_slice(rest);
                    return Ok(taken);
                };

                self.line.extend_from_slice(&rest[..i]);
                let blank = matches!(self.line.as_slice(), b"" | b"\r");
                self.line.clear();

                if blank {
                    self.complete(settings, ctx)?;
                }
                Ok(taken)
            }
        }
    }

    fn parse_head<T>(
        &mut self,
        settings: &Settings<T>,
        ctx: &mut T,
        rest: &[u8],
    ) -> Result<usize, ParseError> {
        let mut skipped = 0;

        if self.head.is_empty() {
            // Empty lines ahead of the request line are ignored
            skipped = rest.iter().take_while(|&&b| matches!(b, b'\r' | b'\n')).count();
            if skipped == rest.len() {
                return Ok(skipped);
            }
            notify(settings.on_message_begin, ctx, "on_message_begin", &mut self.paused)?;
        }

        let rest = &rest[skipped..];
        let prior = self.head.len();
        self.head.extend_from_slice(rest);

        // httparse rescans from the start, so a head trickling in is only
        // looked at again once its terminating blank line shows up
        if prior > 0 && !has_blank_line(&self.head[prior.saturating_sub(2)..]) {
            if self.head.len() > MAX_HEAD_SIZE {
                return Err(ParseError::HeadTooLarge);
            }
            return Ok(skipped + rest.len());
        }

        #[cfg(test)]
        {
            self.head_parses += 1;
        }

        let (total, framing) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);

            let total = match req.parse(&self.head)? {
                httparse::Status::Complete(total) => total,
                httparse::Status::Partial if self.head.len() > MAX_HEAD_SIZE => {
                    return Err(ParseError::HeadTooLarge);
                }
                httparse::Status::Partial => return Ok(skipped + rest.len()),
            };

            if let Some(path) = req.path {
                notify_data(settings.on_url, ctx, path.as_bytes(), "on_url", &mut self.paused)?;
            }

            for header in req.headers.iter() {
                if let Some(cb) = settings.on_header {
                    obey(cb(ctx, header.name, header.value), "on_header", &mut self.paused)?;
                }
            }

            (total, body_framing(req.headers)?)
        };

        self.head.clear();
        notify(settings.on_headers_complete, ctx, "on_headers_complete", &mut self.paused)?;

        match framing {
            Framing::None | Framing::Length(0) => self.complete(settings, ctx)?,
            Framing::Length(n) => self.phase = Phase::Body { remaining: n },
            Framing::Chunked => self.phase = Phase::ChunkSize,
        }

        Ok(skipped + total - prior)
    }

    fn buffer_line(&mut self, bytes: &[u8], limit: usize, err: ParseError) -> Result<(), ParseError> {
        if self.line.len() + bytes.len() > limit {
            return Err(err);
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }

    fn complete<T>(&mut self, settings: &Settings<T>, ctx: &mut T) -> Result<(), ParseError> {
        self.phase = Phase::Head;
        notify(settings.on_message_complete, ctx, "on_message_complete", &mut self.paused)
    }
}

fn notify<T>(
    cb: Option<Notify<T>>,
    ctx: &mut T,
    event: &'static str,
    paused: &mut bool,
) -> Result<(), ParseError> {
    obey(cb.map_or(Control::Continue, |cb| cb(ctx)), event, paused)
}

fn notify_data<T>(
    cb: Option<Data<T>>,
    ctx: &mut T,
    bytes: &[u8],
    event: &'static str,
    paused: &mut bool,
) -> Result<(), ParseError> {
    obey(cb.map_or(Control::Continue, |cb| cb(ctx, bytes)), event, paused)
}

fn obey(control: Control, event: &'static str, paused: &mut bool) -> Result<(), ParseError> {
    match control {
        Control::Continue => {}
        Control::Pause => *paused = true,
        Control::Abort => return Err(ParseError::Aborted { event }),
    }
    Ok(())
}

/// Whether `bytes` holds the empty line that ends a head.
fn has_blank_line(bytes: &[u8]) -> bool {
    bytes.windows(2).any(|w| w == b"\n\n") || bytes.windows(3).any(|w| w == b"\n\r\n")
}

fn body_framing(headers: &[httparse::Header<'_>]) -> Result<Framing, ParseError> {
    let mut length = None;
    let mut chunked = false;

    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            // Only the final coding decides whether the body is chunked
            chunked = header
                .value
                .rsplit(|&b| b == b',')
                .next()
                .map_or(false, |coding| trim(coding).eq_ignore_ascii_case(b"chunked"));
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let value = trim(header.value);
            if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
                return Err(ParseError::InvalidContentLength);
            }

            let n = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(ParseError::InvalidContentLength)?;

            match length {
                Some(prev) if prev != n => return Err(ParseError::InvalidContentLength),
                _ => length = Some(n),
            }
        }
    }

    Ok(match (chunked, length) {
        (true, _) => Framing::Chunked,
        (false, Some(n)) => Framing::Length(n),
        (false, None) => Framing::None,
    })
}

fn chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let digits = match line.iter().position(|&b| b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let digits = trim(digits);

    if digits.is_empty() || digits.len() > 16 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::InvalidChunkSize);
    }

    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or(ParseError::InvalidChunkSize)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
