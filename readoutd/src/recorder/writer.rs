//! Buffered element writer and reader for raw recordings.
//!
//! Elements flow through an optional compressor into an aligned in-memory
//! block buffer; full blocks go to the file with O_DIRECT enabled, the
//! unaligned tail is written after clearing O_DIRECT via `fcntl(F_SETFL)`.
//! The reader applies the reverse filter chain.

use std::alloc::{alloc, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use log::debug;
use readout_frames::FrameChunk;
use serde::Deserialize;

use crate::error::{ReadoutError, Result};

/// Block and buffer alignment required for O_DIRECT file writes.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Zstd,
    Zlib,
    Lzma,
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "none" => Ok(Self::None),
            "zstd" => Ok(Self::Zstd),
            "zlib" => Ok(Self::Zlib),
            "lzma" => Ok(Self::Lzma),
            other => Err(format!("unrecognised compression algorithm: {other}")),
        }
    }
}

/// Toggle O_DIRECT on an open descriptor.
pub fn set_o_direct(file: &File, enable: bool) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enable {
        flags | libc::O_DIRECT
    } else {
        flags & !libc::O_DIRECT
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fixed-size buffer with an allocation aligned for O_DIRECT.
struct AlignedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    len: usize,
}

unsafe impl Send for AlignedBlock {}

impl AlignedBlock {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, DIRECT_IO_ALIGNMENT).expect("block layout");
        let ptr = NonNull::new(unsafe { alloc(layout) }).expect("block allocation failed");
        Self {
            ptr,
            layout,
            capacity,
            len: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(self.len), n);
        }
        self.len += n;
        n
    }

    fn filled(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// File sink writing whole aligned blocks; the tail goes out unaligned with
/// O_DIRECT cleared when the stream finishes.
pub struct BlockSink {
    file: File,
    block: AlignedBlock,
    use_o_direct: bool,
}

impl BlockSink {
    fn open(path: &Path, buffer_size: usize, use_o_direct: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        if use_o_direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(path).map_err(|source| ReadoutError::CannotOpenFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            block: AlignedBlock::new(buffer_size),
            use_o_direct,
        })
    }

    fn flush_full_block(&mut self) -> io::Result<()> {
        self.file.write_all(self.block.filled())?;
        self.block.clear();
        Ok(())
    }

    fn finish(mut self) -> io::Result<()> {
        if self.block.len > 0 {
            if self.use_o_direct {
                // The remainder is not block-sized; O_DIRECT must come off.
                set_o_direct(&self.file, false)?;
            }
            self.file.write_all(self.block.filled())?;
            self.block.clear();
        }
        Ok(())
    }
}

impl Write for BlockSink {
    fn write(&mut self, mut data: &[u8]) -> io::Result<usize> {
        let total = data.len();
        while !data.is_empty() {
            let n = self.block.push(data);
            data = &data[n..];
            if self.block.remaining() == 0 {
                self.flush_full_block()?;
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial blocks are held back: flushing them would break the file
        // offset alignment O_DIRECT requires. The tail goes out in finish().
        Ok(())
    }
}

enum WriterInner {
    Plain(BlockSink),
    Zstd(zstd::stream::write::Encoder<'static, BlockSink>),
    Zlib(flate2::write::ZlibEncoder<BlockSink>),
    Lzma(xz2::write::XzEncoder<BlockSink>),
}

/// Element writer with an optional compression filter in front of the
/// aligned block sink.
pub struct BufferedFileWriter {
    inner: Option<WriterInner>,
    path: PathBuf,
}

impl BufferedFileWriter {
    pub fn open(
        path: &Path,
        buffer_size: usize,
        algorithm: CompressionAlgorithm,
        use_o_direct: bool,
    ) -> Result<Self> {
        let sink = BlockSink::open(path, buffer_size, use_o_direct)?;
        let inner = match algorithm {
            CompressionAlgorithm::None => {
                debug!("recording without compression");
                WriterInner::Plain(sink)
            }
            CompressionAlgorithm::Zstd => {
                debug!("recording with zstd compression");
                WriterInner::Zstd(zstd::stream::write::Encoder::new(sink, 1)?)
            }
            CompressionAlgorithm::Zlib => {
                debug!("recording with zlib compression");
                WriterInner::Zlib(flate2::write::ZlibEncoder::new(
                    sink,
                    flate2::Compression::fast(),
                ))
            }
            CompressionAlgorithm::Lzma => {
                debug!("recording with lzma compression");
                WriterInner::Lzma(xz2::write::XzEncoder::new(sink, 0))
            }
        };
        Ok(Self {
            inner: Some(inner),
            path: path.to_path_buf(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one element. Returns false if the writer is closed or the
    /// write failed; the caller counts failures and carries on.
    pub fn write_element<T: FrameChunk>(&mut self, element: &T) -> bool {
        self.write_bytes(element.as_bytes()).is_ok()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(WriterInner::Plain(sink)) => sink.write_all(bytes),
            Some(WriterInner::Zstd(encoder)) => encoder.write_all(bytes),
            Some(WriterInner::Zlib(encoder)) => encoder.write_all(bytes),
            Some(WriterInner::Lzma(encoder)) => encoder.write_all(bytes),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "writer closed")),
        }
    }

    /// Drain the compressor and write the unaligned tail. The writer is
    /// closed afterwards.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.inner.take() {
            Some(WriterInner::Plain(sink)) => sink.finish(),
            Some(WriterInner::Zstd(encoder)) => encoder.finish()?.finish(),
            Some(WriterInner::Zlib(encoder)) => encoder.finish()?.finish(),
            Some(WriterInner::Lzma(encoder)) => encoder.finish()?.finish(),
            None => Ok(()),
        }
    }
}

impl Drop for BufferedFileWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

enum ReaderInner {
    Plain(BufReader<File>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<File>>),
    Zlib(flate2::read::ZlibDecoder<BufReader<File>>),
    Lzma(xz2::read::XzDecoder<BufReader<File>>),
}

/// Reverse filter chain: decompress and hand back fixed-size elements.
pub struct BufferedFileReader {
    inner: ReaderInner,
}

impl BufferedFileReader {
    pub fn open(path: &Path, algorithm: CompressionAlgorithm) -> Result<Self> {
        let file = File::open(path).map_err(|source| ReadoutError::CannotOpenFile {
            path: path.to_path_buf(),
            source,
        })?;
        let buffered = BufReader::new(file);
        let inner = match algorithm {
            CompressionAlgorithm::None => ReaderInner::Plain(buffered),
            CompressionAlgorithm::Zstd => {
                ReaderInner::Zstd(zstd::stream::read::Decoder::with_buffer(buffered)?)
            }
            CompressionAlgorithm::Zlib => ReaderInner::Zlib(flate2::read::ZlibDecoder::new(buffered)),
            CompressionAlgorithm::Lzma => ReaderInner::Lzma(xz2::read::XzDecoder::new(buffered)),
        };
        Ok(Self { inner })
    }

    /// Next element, or `None` at a clean end of stream.
    pub fn read_element<T: FrameChunk>(&mut self) -> io::Result<Option<T>> {
        let mut bytes = vec![0u8; std::mem::size_of::<T>()];
        match self.read_exact_or_eof(&mut bytes)? {
            true => Ok(T::read_from(&bytes)),
            false => Ok(None),
        }
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = match &mut self.inner {
                ReaderInner::Plain(r) => r.read(&mut buf[filled..])?,
                ReaderInner::Zstd(r) => r.read(&mut buf[filled..])?,
                ReaderInner::Zlib(r) => r.read(&mut buf[filled..])?,
                ReaderInner::Lzma(r) => r.read(&mut buf[filled..])?,
            };
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated element at end of recording",
                ));
            }
            filled += n;
        }
        Ok(true)
    }
}
