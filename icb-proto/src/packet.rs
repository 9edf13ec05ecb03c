//! ICB packet framing, encoding, and decoding.
//!
//! Wire format: `[len: u8][payload]`. The payload is a one-byte command
//! code followed by fields separated by `0x01`, with an optional trailing
//! `0x00`. The length byte counts the whole payload, so a payload never
//! exceeds [`MAX_PAYLOAD`] bytes.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = 255;

/// Largest open-message text sent in one packet.
///
/// Servers prepend the sender's nickname when forwarding an open message,
/// so this stays well below [`MAX_PAYLOAD`].
pub const MAX_OPEN_TEXT: usize = 230;

/// Byte separating fields within a payload.
pub const FIELD_SEPARATOR: u8 = 0x01;

/// Byte terminating a payload.
const TERMINATOR: u8 = 0x00;

/// Errors produced while encoding or decoding a packet payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// The payload carried no command code.
    #[error("empty packet")]
    Empty,
    /// The field bytes are not valid UTF-8.
    #[error("packet fields are not valid UTF-8")]
    InvalidUtf8,
    /// The encoded payload does not fit the one-byte length prefix.
    #[error("payload too long: {0} bytes (max {MAX_PAYLOAD})")]
    TooLong(usize),
    /// A field contains a separator or terminator byte.
    #[error("field {index} contains a reserved byte")]
    InvalidField {
        /// Position of the offending field (the command code is field 0).
        index: usize,
    },
}

/// Errors produced while reading a frame off the stream.
///
/// Unlike [`PacketError`], these leave the stream in an unknown state and
/// cannot be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,
    /// An underlying I/O error occurred.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// ICB command codes.
///
/// [`CommandCode::from_byte`] is total: bytes outside the known set map to
/// [`CommandCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    /// `a` -- login request / login acknowledgment.
    LoginOk,
    /// `b` -- open (public) message.
    Open,
    /// `c` -- personal message.
    Personal,
    /// `d` -- status message.
    Status,
    /// `e` -- error message.
    Error,
    /// `f` -- important message.
    Important,
    /// `g` -- exit.
    Exit,
    /// `h` -- command.
    Command,
    /// `i` -- command output.
    CommandOutput,
    /// `j` -- protocol / group join confirmation.
    Protocol,
    /// `k` -- beep.
    Beep,
    /// `l` -- ping.
    Ping,
    /// `m` -- pong.
    Pong,
    /// `n` -- no-op.
    NoOp,
    /// Any other byte.
    Unknown(u8),
}

impl CommandCode {
    /// Maps a wire byte to its command code.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            b'a' => Self::LoginOk,
            b'b' => Self::Open,
            b'c' => Self::Personal,
            b'd' => Self::Status,
            b'e' => Self::Error,
            b'f' => Self::Important,
            b'g' => Self::Exit,
            b'h' => Self::Command,
            b'i' => Self::CommandOutput,
            b'j' => Self::Protocol,
            b'k' => Self::Beep,
            b'l' => Self::Ping,
            b'm' => Self::Pong,
            b'n' => Self::NoOp,
            other => Self::Unknown(other),
        }
    }

    /// Returns the wire byte for this code.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::LoginOk => b'a',
            Self::Open => b'b',
            Self::Personal => b'c',
            Self::Status => b'd',
            Self::Error => b'e',
            Self::Important => b'f',
            Self::Exit => b'g',
            Self::Command => b'h',
            Self::CommandOutput => b'i',
            Self::Protocol => b'j',
            Self::Beep => b'k',
            Self::Ping => b'l',
            Self::Pong => b'm',
            Self::NoOp => b'n',
            Self::Unknown(byte) => byte,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", char::from(self.as_byte()))
    }
}

/// One decoded ICB packet.
///
/// Field 0 is always the command code rendered as a one-character string;
/// the meaning of the remaining fields depends on the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    code: CommandCode,
    fields: Vec<String>,
}

impl Packet {
    /// Builds a packet from a code and its argument fields.
    pub fn new<I, S>(code: CommandCode, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = vec![code.to_string()];
        fields.extend(args.into_iter().map(Into::into));
        Self { code, fields }
    }

    /// Login packet joining `group` as `nick`.
    #[must_use]
    pub fn login(nick: &str, group: &str) -> Self {
        Self::new(CommandCode::LoginOk, [nick, nick, group, "login"])
    }

    /// Open message to the current group.
    #[must_use]
    pub fn open(text: &str) -> Self {
        Self::new(CommandCode::Open, [text])
    }

    /// Keep-alive reply to a server ping.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(CommandCode::Pong, std::iter::empty::<String>())
    }

    /// The packet's command code.
    #[must_use]
    pub const fn code(&self) -> CommandCode {
        self.code
    }

    /// All fields, the command code first.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Returns field `index`, if present.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Joins the fields from `start` onward with single spaces.
    ///
    /// Returns an empty string when `start` is past the last field.
    #[must_use]
    pub fn join_from(&self, start: usize) -> String {
        self.fields.get(start..).unwrap_or_default().join(" ")
    }
}

/// Decodes a frame payload (without its length prefix) into a [`Packet`].
///
/// # Errors
///
/// Returns [`PacketError::Empty`] for an empty payload and
/// [`PacketError::InvalidUtf8`] when the fields are not UTF-8.
pub fn decode(payload: &[u8]) -> Result<Packet, PacketError> {
    let payload = payload.strip_suffix(&[TERMINATOR]).unwrap_or(payload);
    let (&code, rest) = payload.split_first().ok_or(PacketError::Empty)?;
    let code = CommandCode::from_byte(code);
    let text = std::str::from_utf8(rest).map_err(|_| PacketError::InvalidUtf8)?;

    let mut fields = vec![code.to_string()];
    if !text.is_empty() {
        fields.extend(
            text.split(char::from(FIELD_SEPARATOR))
                .map(ToString::to_string),
        );
    }
    Ok(Packet { code, fields })
}

/// Encodes a [`Packet`] into a complete frame, length prefix included.
///
/// # Errors
///
/// Returns [`PacketError::InvalidField`] if a field contains a separator or
/// terminator byte, or [`PacketError::TooLong`] if the payload exceeds
/// [`MAX_PAYLOAD`].
pub fn encode(packet: &Packet) -> Result<Vec<u8>, PacketError> {
    let mut payload = Vec::with_capacity(MAX_PAYLOAD);
    payload.push(packet.code.as_byte());
    for (index, field) in packet.fields.iter().enumerate().skip(1) {
        if field.bytes().any(|b| b == FIELD_SEPARATOR || b == TERMINATOR) {
            return Err(PacketError::InvalidField { index });
        }
        if index > 1 {
            payload.push(FIELD_SEPARATOR);
        }
        payload.extend_from_slice(field.as_bytes());
    }
    payload.push(TERMINATOR);

    let len = u8::try_from(payload.len()).map_err(|_| PacketError::TooLong(payload.len()))?;
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(len);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Splits message text into open-message chunks.
///
/// Text that fits in [`MAX_OPEN_TEXT`] is one chunk, newlines and all.
/// Longer text is cut at the last line break that fits, else at the last
/// space, else at a char boundary. Reserved bytes are dropped; text that is
/// empty or only whitespace yields no chunks.
#[must_use]
pub fn split_open_text(text: &str) -> Vec<String> {
    let text: String = text
        .chars()
        .filter(|&c| c != char::from(FIELD_SEPARATOR) && c != char::from(TERMINATOR))
        .collect();
    let mut chunks = Vec::new();
    if !text.trim().is_empty() {
        chunk_text(&text, &mut chunks);
    }
    chunks
}

fn chunk_text(text: &str, chunks: &mut Vec<String>) {
    let mut rest = text;
    while rest.len() > MAX_OPEN_TEXT {
        let mut cut = MAX_OPEN_TEXT;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let window = &rest[..cut];
        let split = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);
        chunks.push(rest[..split].trim_end().to_string());
        rest = rest[split..].trim_start();
    }
    if !rest.trim().is_empty() {
        chunks.push(rest.to_string());
    }
}

/// Reads length-prefixed frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a readable stream.
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame and returns its payload.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Closed`] when the stream ends, including in the
    /// middle of a frame, and [`ReadError::Io`] for other I/O failures.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, ReadError> {
        let len = self.inner.read_u8().await.map_err(map_eof)?;
        let mut payload = vec![0; usize::from(len)];
        self.inner.read_exact(&mut payload).await.map_err(map_eof)?;
        Ok(payload)
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn map_eof(e: std::io::Error) -> ReadError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ReadError::Closed
    } else {
        ReadError::Io(e)
    }
}
