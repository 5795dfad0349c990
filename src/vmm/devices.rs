use log::warn;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};

/// Port I/O backend serviced by the run loop.
pub trait PortIo {
    /// Fills `data` for a guest read of `port`. `size` is the width of one
    /// transfer; `data.len()` is a multiple of it.
    fn read(&mut self, port: u16, size: usize, data: &mut [u8]) -> io::Result<()>;

    /// Receives the bytes of a guest write to `port`.
    fn write(&mut self, port: u16, size: usize, data: &[u8]) -> io::Result<()>;
}

/// Little-endian value of one transfer.
fn chunk_value(chunk: &[u8]) -> u64 {
    chunk
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Interactive port: prompts for a decimal value on every read and prints
/// every written value.
pub struct ConsolePort<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsolePort<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Prompts until a decimal value is entered. Running out of input is an
    /// error since the guest would otherwise read a made-up value.
    fn next_value(&mut self) -> io::Result<u64> {
        loop {
            write!(self.output, "Enter value to send: ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "console input closed while the guest waits for a value",
                ));
            }
            match line.trim().parse() {
                Ok(value) => return Ok(value),
                Err(_) => warn!("console input {:?} is not a decimal number", line.trim()),
            }
        }
    }
}

impl ConsolePort<io::BufReader<io::Stdin>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> PortIo for ConsolePort<R, W> {
    fn read(&mut self, _port: u16, size: usize, data: &mut [u8]) -> io::Result<()> {
        for chunk in data.chunks_mut(size.max(1)) {
            let bytes = self.next_value()?.to_le_bytes();
            let n = chunk.len().min(bytes.len());
            chunk[..n].copy_from_slice(&bytes[..n]);
            writeln!(self.output, "SENT: {}", chunk_value(chunk))?;
        }
        self.output.flush()
    }

    fn write(&mut self, _port: u16, size: usize, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(size.max(1)) {
            writeln!(self.output, "RECEIVED: {}", chunk_value(chunk))?;
        }
        self.output.flush()
    }
}

/// In-memory echo: a read returns the last transfer written to the same
/// port, or all ones if the port was never written.
#[derive(Debug, Default)]
pub struct EchoPort {
    latched: HashMap<u16, Vec<u8>>,
    writes: Vec<(u16, Vec<u8>)>,
}

impl EchoPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write seen so far, in order.
    pub fn writes(&self) -> &[(u16, Vec<u8>)] {
        &self.writes
    }
}

impl PortIo for EchoPort {
    fn read(&mut self, port: u16, size: usize, data: &mut [u8]) -> io::Result<()> {
        let latched = self.latched.get(&port);
        for chunk in data.chunks_mut(size.max(1)) {
            match latched {
                Some(value) => {
                    for (i, byte) in chunk.iter_mut().enumerate() {
                        *byte = value.get(i).copied().unwrap_or(0);
                    }
                }
                None => chunk.fill(0xff),
            }
        }
        Ok(())
    }

    fn write(&mut self, port: u16, size: usize, data: &[u8]) -> io::Result<()> {
        if let Some(last) = data.chunks(size.max(1)).last() {
            self.latched.insert(port, last.to_vec());
        }
        self.writes.push((port, data.to_vec()));
        Ok(())
    }
}
