//! binkp frame codec (FTS-1026).
//!
//! Every frame starts with a 2 byte big-endian header: the high bit marks a
//! command frame, the low 15 bits give the length of what follows. For
//! command frames the length covers the command byte plus its argument.
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-+-----------------------------+---------+------------------
//! |C|          length             | cmd (C) | payload ...
//! +-+-----------------------------+---------+------------------
//! ```
//!
//! [`BinkpFramer`] is an incremental decoder fed with arbitrary chunks;
//! [`FrameReader`] drives it from an async stream with timeouts, keeping any
//! partially received frame across calls so a short poll never loses bytes.
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest value the 15 bit length field can carry.
pub const MAX_FRAME_LEN: usize = 0x7FFF;
/// Largest data block we emit when streaming a file.
pub const DATA_BLOCK_SIZE: usize = 4096;
const HEADER_LEN: usize = 2;
const COMMAND_FLAG: u16 = 0x8000;
/// Extra attempts a blocking read gets after its first wait expires.
const BLOCKING_READ_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nul,
    Adr,
    Pwd,
    File,
    Ok,
    Eob,
    Got,
    Err,
    Bsy,
    Get,
    Skip,
    /// A command byte outside 0..=10; binkp says to ignore these.
    Unknown(u8),
}

impl Command {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => Command::Nul,
            1 => Command::Adr,
            2 => Command::Pwd,
            3 => Command::File,
            4 => Command::Ok,
            5 => Command::Eob,
            6 => Command::Got,
            7 => Command::Err,
            8 => Command::Bsy,
            9 => Command::Get,
            10 => Command::Skip,
            other => Command::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Command::Nul => 0,
            Command::Adr => 1,
            Command::Pwd => 2,
            Command::File => 3,
            Command::Ok => 4,
            Command::Eob => 5,
            Command::Got => 6,
            Command::Err => 7,
            Command::Bsy => 8,
            Command::Get => 9,
            Command::Skip => 10,
            Command::Unknown(b) => b,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Nul => "M_NUL",
            Command::Adr => "M_ADR",
            Command::Pwd => "M_PWD",
            Command::File => "M_FILE",
            Command::Ok => "M_OK",
            Command::Eob => "M_EOB",
            Command::Got => "M_GOT",
            Command::Err => "M_ERR",
            Command::Bsy => "M_BSY",
            Command::Get => "M_GET",
            Command::Skip => "M_SKIP",
            Command::Unknown(_) => "M_???",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversize(usize),

    #[error("command frame without a command byte")]
    EmptyCommand,

    #[error("read timed out")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command { command: Command, args: Bytes },
    Data(Bytes),
}

impl Frame {
    /// Build a command frame; fails if command byte plus argument exceed the length field.
    pub fn command(command: Command, args: impl Into<Bytes>) -> Result<Self, FrameError> {
        let args = args.into();
        if args.len() + 1 > MAX_FRAME_LEN {
            return Err(FrameError::Oversize(args.len() + 1));
        }
        Ok(Frame::Command { command, args })
    }

    pub fn data(payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversize(payload.len()));
        }
        Ok(Frame::Data(payload))
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Frame::Command { .. })
    }

    /// Value of the 15 bit length field.
    pub fn length(&self) -> usize {
        match self {
            Frame::Command { args, .. } => args.len() + 1,
            Frame::Data(p) => p.len(),
        }
    }

    /// Command argument as text (lossy); empty for data frames.
    pub fn args_str(&self) -> String {
        match self {
            Frame::Command { args, .. } => {
                let trimmed = args.strip_suffix(&[0u8]).unwrap_or(&args[..]);
                String::from_utf8_lossy(trimmed).into_owned()
            }
            Frame::Data(_) => String::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.length();
        let mut header = len as u16;
        if self.is_command() {
            header |= COMMAND_FLAG;
        }
        let mut out = Vec::with_capacity(HEADER_LEN + len);
        out.extend_from_slice(&header.to_be_bytes());
        match self {
            Frame::Command { command, args } => {
                out.push(command.to_byte());
                out.extend_from_slice(args);
            }
            Frame::Data(p) => out.extend_from_slice(p),
        }
        out
    }
}

/// Incremental binkp frame decoder.
#[derive(Debug, Default)]
pub struct BinkpFramer {
    buf: BytesMut,
}

impl BinkpFramer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(MAX_FRAME_LEN + HEADER_LEN) }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True while some bytes of an incomplete frame are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Extract the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let is_command = header & COMMAND_FLAG != 0;
        let len = (header & !COMMAND_FLAG) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let mut body = self.buf.split_to(len).freeze();
        if !is_command {
            return Ok(Some(Frame::Data(body)));
        }
        if body.is_empty() {
            return Err(FrameError::EmptyCommand);
        }
        let command = Command::from_byte(body[0]);
        body.advance(1);
        Ok(Some(Frame::Command { command, args: body }))
    }
}

/// Reads frames from an async byte stream.
pub struct FrameReader {
    framer: BinkpFramer,
    chunk: Vec<u8>,
    stall: Duration,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self { framer: BinkpFramer::new(), chunk: vec![0u8; 8192], stall: Duration::ZERO }
    }

    /// Lower bound for each read while a frame is half received, so a short
    /// polling `wait` does not cut a slow peer off mid-frame.
    pub fn with_stall_timeout(mut self, stall: Duration) -> Self {
        self.stall = stall;
        self
    }

    /// Read one frame.
    ///
    /// `wait` bounds each read. In non-blocking mode an expired wait with
    /// nothing buffered yields `Ok(None)`. Otherwise (blocking, or a frame
    /// already half received) the read is retried a couple of times before
    /// giving up with [`FrameError::Timeout`]. Once part of a frame is
    /// buffered each read waits at least the stall timeout. End of stream is
    /// always [`FrameError::ConnectionClosed`].
    pub async fn read_frame<R>(
        &mut self,
        reader: &mut R,
        wait: Duration,
        non_blocking: bool,
    ) -> Result<Option<Frame>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut expired = 0u32;
        loop {
            if let Some(frame) = self.framer.next_frame()? {
                return Ok(Some(frame));
            }
            let limit = if self.framer.has_partial() { wait.max(self.stall) } else { wait };
            match tokio::time::timeout(limit, reader.read(&mut self.chunk)).await {
                Ok(Ok(0)) => return Err(FrameError::ConnectionClosed),
                Ok(Ok(n)) => {
                    let Self { framer, chunk, .. } = self;
                    framer.push(&chunk[..n]);
                }
                Ok(Err(e)) => return Err(FrameError::Io(e)),
                Err(_) => {
                    if non_blocking && !self.framer.has_partial() {
                        return Ok(None);
                    }
                    expired += 1;
                    if expired > BLOCKING_READ_RETRIES {
                        return Err(FrameError::Timeout);
                    }
                }
            }
        }
    }
}

/// Write one frame and flush it immediately.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
