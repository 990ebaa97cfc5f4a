use crate::bufio::BufIo;
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use futures_util::ready;
use std::io;
use std::io::Write;
use std::task::{Context, Poll};

/// Largest single chunk size accepted from a peer.
const MAX_CHUNK_SIZE: u64 = 0xffff_ffff;

/// Decoder of `transfer-encoding: chunked`.
///
/// Drives off the buffered reader so control characters (size lines,
/// delimiters, trailers) are parsed in place while chunk data is served
/// straight into the caller's buffer.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: Dec,
}

#[derive(Debug)]
enum Dec {
    /// Hex chunk size followed by optional extension and CRLF.
    Size {
        size: u64,
        any_digit: bool,
        in_ext: bool,
        cr: bool,
    },
    /// Inside chunk data.
    Data { left: u64 },
    /// CRLF trailing the chunk data.
    DataCr,
    DataLf,
    /// Trailer lines after the zero-size chunk, ended by an empty line.
    Trailer { line_len: usize, cr: bool },
    End,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: Dec::size(),
        }
    }

    pub fn is_end(&self) -> bool {
        match self.state {
            Dec::End => true,
            _ => false,
        }
    }

    pub fn poll_read<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut BufIo<S>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if let Dec::Data { left } = &mut self.state {
                let max = buf.len().min((*left).min(usize::max_value() as u64) as usize);

                let amount = ready!(recv.poll_read_buf(cx, &mut buf[0..max]))?;

                if amount == 0 {
                    return Err(partial()).into();
                }

                *left -= amount as u64;

                if *left == 0 {
                    self.state = Dec::DataCr;
                }

                return Ok(amount).into();
            }

            if let Dec::End = self.state {
                return Ok(0).into();
            }

            // control characters are parsed out of the buffered bytes.
            if recv.buffered().is_empty() {
                let amount = ready!(recv.poll_fill_more(cx))?;

                if amount == 0 {
                    return Err(partial()).into();
                }
            }

            let mut used = 0;

            let transition = {
                let buffered = recv.buffered();
                self.parse_control(buffered, &mut used)
            };

            recv.consume(used);

            if let Err(e) = transition {
                return Err(e).into();
            }
        }
    }

    /// Advance the control-character states over `buffered`, recording how
    /// many bytes were used. Stops as soon as a data/end state is reached.
    fn parse_control(&mut self, buffered: &[u8], used: &mut usize) -> io::Result<()> {
        for c in buffered {
            let c = *c;
            *used += 1;

            match &mut self.state {
                Dec::Size {
                    size,
                    any_digit,
                    in_ext,
                    cr,
                } => {
                    if *cr {
                        if c != b'\n' {
                            return Err(bad(format!(
                                "Expected LF after CR in chunk size, got: {:?}",
                                c as char
                            )));
                        }
                        if !*any_digit {
                            return Err(bad("No size in chunk".to_string()));
                        }
                        if *size == 0 {
                            self.state = Dec::Trailer {
                                line_len: 0,
                                cr: false,
                            };
                        } else {
                            self.state = Dec::Data { left: *size };
                            return Ok(());
                        }
                    } else if c == b'\r' {
                        *cr = true;
                    } else if *in_ext {
                        // chunk extensions are ignored up to the CR.
                    } else if c == b';' {
                        *in_ext = true;
                    } else if let Some(digit) = hex_digit(c) {
                        *size = *size * 16 + digit;
                        *any_digit = true;

                        if *size > MAX_CHUNK_SIZE {
                            return Err(bad(format!("Chunk size too big: {}", size)));
                        }
                    } else {
                        return Err(bad(format!(
                            "Unexpected char in chunk size: {:?}",
                            c as char
                        )));
                    }
                }

                Dec::Data { .. } | Dec::End => {
                    // invariant: handled before control parsing.
                    unreachable!("parse_control in data/end state");
                }

                Dec::DataCr => {
                    if c != b'\r' {
                        return Err(bad(format!(
                            "Expected CR after chunk data, got: {:?}",
                            c as char
                        )));
                    }
                    self.state = Dec::DataLf;
                }

                Dec::DataLf => {
                    if c != b'\n' {
                        return Err(bad(format!(
                            "Expected LF after chunk data, got: {:?}",
                            c as char
                        )));
                    }
                    self.state = Dec::size();
                }

                Dec::Trailer { line_len, cr } => {
                    if *cr {
                        if c != b'\n' {
                            return Err(bad(format!(
                                "Expected LF after CR in trailer, got: {:?}",
                                c as char
                            )));
                        }
                        if *line_len == 0 {
                            self.state = Dec::End;
                            return Ok(());
                        }
                        *line_len = 0;
                        *cr = false;
                    } else if c == b'\r' {
                        *cr = true;
                    } else {
                        *line_len += 1;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Dec {
    fn size() -> Self {
        Dec::Size {
            size: 0,
            any_digit: false,
            in_ext: false,
            cr: false,
        }
    }
}

fn hex_digit(c: u8) -> Option<u64> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u64),
        b'a'..=b'f' => Some((c - b'a' + 10) as u64),
        b'A'..=b'F' => Some((c - b'A' + 10) as u64),
        _ => None,
    }
}

fn bad(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn partial() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "Partial body")
}

/// Encoder of `transfer-encoding: chunked`.
pub(crate) struct ChunkedEncoder;

impl ChunkedEncoder {
    /// Frame one chunk. Empty input writes nothing, since a zero size chunk
    /// would terminate the body.
    pub fn write_chunk(data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        write!(out, "{:x}\r\n", data.len()).expect("write to vec");
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");

        Ok(())
    }

    /// Terminal marker, written once after the last chunk.
    pub fn write_finish(out: &mut Vec<u8>) -> Result<(), Error> {
        out.extend_from_slice(b"0\r\n\r\n");
        Ok(())
    }
}
