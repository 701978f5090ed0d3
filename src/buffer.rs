use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::util::next_file_index;

/// Capacity of the in-memory record buffer in front of every log file.
pub const BUFFER_SIZE: usize = 4096;

pub const SERIAL_BEGIN: &[u8] = b"[BUF/BEGIN]";
pub const SERIAL_CLOSE: &[u8] = b"[BUF/CLOSE]";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("refusing to buffer an empty record")]
    EmptyRecord,

    #[error("record of {size} bytes does not fit the {capacity} byte buffer")]
    TooLarge { size: usize, capacity: usize },

    #[error("log writer has stopped")]
    WriterStopped,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("pcap error: {0}")]
    Pcap(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Fixed-capacity byte buffer of whole records.
///
/// A record that would overflow the buffer hands the current contents back to
/// the caller as a chunk to flush, then starts the next chunk. Records are
/// never split across chunks.
#[derive(Debug)]
pub struct RecordBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> RecordBuffer {
        RecordBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: &[u8]) -> Result<Option<Vec<u8>>, CaptureError> {
        if record.is_empty() {
            return Err(CaptureError::EmptyRecord);
        }
        if record.len() > self.capacity {
            return Err(CaptureError::TooLarge {
                size: record.len(),
                capacity: self.capacity,
            });
        }
        let flushed = if self.data.len() + record.len() > self.capacity {
            Some(self.take())
        } else {
            None
        };
        self.data.extend_from_slice(record);
        Ok(flushed)
    }

    /// Removes and returns everything buffered so far.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.data, Vec::with_capacity(self.capacity))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    File,
    Serial,
    /// The file write failed; the chunk went to serial and the file is
    /// abandoned for the rest of the session.
    Fallback(String),
}

/// Destination of flushed chunks: a capture file when one could be opened,
/// framed serial output otherwise.
pub struct Sink {
    file: Option<Box<dyn Write + Send>>,
    path: Option<PathBuf>,
    serial: Box<dyn Write + Send>,
}

impl Sink {
    pub fn serial(serial: Box<dyn Write + Send>) -> Sink {
        Sink {
            file: None,
            path: None,
            serial,
        }
    }

    pub fn with_writer(
        file: Box<dyn Write + Send>,
        path: PathBuf,
        serial: Box<dyn Write + Send>,
    ) -> Sink {
        Sink {
            file: Some(file),
            path: Some(path),
            serial,
        }
    }

    pub fn create(path: &Path, serial: Box<dyn Write + Send>) -> io::Result<Sink> {
        let file = File::create(path)?;
        Ok(Sink::with_writer(
            Box::new(file),
            path.to_path_buf(),
            serial,
        ))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<Delivery, CaptureError> {
        if let Some(file) = self.file.as_mut() {
            match file.write_all(chunk).and_then(|_| file.flush()) {
                Ok(()) => return Ok(Delivery::File),
                Err(e) => {
                    self.file = None;
                    self.write_serial(chunk)?;
                    return Ok(Delivery::Fallback(e.to_string()));
                }
            }
        }
        self.write_serial(chunk)?;
        Ok(Delivery::Serial)
    }

    fn write_serial(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.serial.write_all(SERIAL_BEGIN)?;
        self.serial.write_all(chunk)?;
        self.serial.write_all(SERIAL_CLOSE)?;
        self.serial.write_all(b"\n")?;
        self.serial.flush()
    }
}

//////////////////////////////////////////////////////////////////////////////
// Background writer

enum Command {
    Chunk(Vec<u8>),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    Flushed { bytes: usize, delivery: Delivery },
    Failed(String),
}

/// Owns a [`Sink`] on its own thread so the frame path never waits on I/O.
pub struct LogWriter {
    name: String,
    tx: Sender<Command>,
    events: Receiver<WriterEvent>,
    handle: Option<JoinHandle<()>>,
}

impl LogWriter {
    pub fn start(name: &str, mut sink: Sink) -> Result<LogWriter, CaptureError> {
        let (tx, rx) = mpsc::channel::<Command>();
        let (event_tx, events) = mpsc::channel::<WriterEvent>();

        let handle = thread::Builder::new()
            .name(format!("{name}-writer"))
            .spawn(move || {
                while let Ok(Command::Chunk(chunk)) = rx.recv() {
                    let event = match sink.write_chunk(&chunk) {
                        Ok(delivery) => WriterEvent::Flushed {
                            bytes: chunk.len(),
                            delivery,
                        },
                        Err(e) => WriterEvent::Failed(e.to_string()),
                    };
                    let _ = event_tx.send(event);
                }
            })?;

        Ok(LogWriter {
            name: name.to_string(),
            tx,
            events,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, chunk: Vec<u8>) -> Result<(), CaptureError> {
        self.tx
            .send(Command::Chunk(chunk))
            .map_err(|_| CaptureError::WriterStopped)
    }

    pub fn poll_events(&self) -> Vec<WriterEvent> {
        self.events.try_iter().collect()
    }

    /// Writes out everything already queued, joins the thread and returns the
    /// events that were not polled yet.
    pub fn stop(&mut self) -> Vec<WriterEvent> {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Command::Stop);
            let _ = handle.join();
        }
        self.poll_events()
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

//////////////////////////////////////////////////////////////////////////////
// Buffer + writer pair

/// A [`RecordBuffer`] in front of a [`LogWriter`]. Opens `<dir>/<base>_<n>.<ext>`
/// when the directory exists and falls back to serial framing when it does
/// not. The header goes out as its own chunk before any record.
pub struct BufferedLog {
    buffer: RecordBuffer,
    writer: LogWriter,
    path: Option<PathBuf>,
    records: u64,
}

pub struct LogTarget<'a> {
    pub dir: Option<&'a Path>,
    pub base: &'a str,
    pub ext: &'a str,
}

impl BufferedLog {
    pub fn open(
        target: LogTarget<'_>,
        serial: Box<dyn Write + Send>,
        capacity: usize,
        header: Vec<u8>,
    ) -> Result<BufferedLog, CaptureError> {
        let (sink, path) = match target.dir {
            Some(dir) if dir.is_dir() => {
                let index = next_file_index(dir, target.base, target.ext)?;
                let path = dir.join(format!("{}_{}.{}", target.base, index, target.ext));
                (Sink::create(&path, serial)?, Some(path))
            }
            _ => (Sink::serial(serial), None),
        };

        let writer = LogWriter::start(target.ext, sink)?;
        if !header.is_empty() {
            writer.send(header)?;
        }

        Ok(BufferedLog {
            buffer: RecordBuffer::new(capacity),
            writer,
            path,
            records: 0,
        })
    }

    pub fn append(&mut self, record: &[u8]) -> Result<(), CaptureError> {
        if let Some(chunk) = self.buffer.push(record)? {
            self.writer.send(chunk)?;
        }
        self.records += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        if !self.buffer.is_empty() {
            self.writer.send(self.buffer.take())?;
        }
        Ok(())
    }

    pub fn poll_events(&self) -> Vec<WriterEvent> {
        self.writer.poll_events()
    }

    /// Flushes what is left and stops the writer.
    pub fn close(mut self) -> Result<Vec<WriterEvent>, CaptureError> {
        self.flush()?;
        Ok(self.writer.stop())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
