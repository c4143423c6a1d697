//! Typed binary envelope shared by every partition file.
//!
//! Every file this crate writes -- count streams, matrix partitions, bit
//! vectors, histograms -- opens with the same fixed prologue:
//!
//! ```text
//! magic:u64  kind:u8  k_version:u32  compressed:u8  reserved:u16
//! <kind-specific header fields>
//! [lz4 block stream | raw] <payload>
//! ```
//!
//! [`FileHeader`] is the kind-specific part; [`PartitionWriter`]/
//! [`PartitionReader`] wrap a raw or LZ4-framed byte stream ([`lz4_stream`])
//! behind fixed-length record read/write. Record *contents* (how a k-mer and
//! its counts are laid out inside a record) are the concern of the modules
//! that produce them ([`crate::counter`], [`crate::merger`],
//! [`crate::matrix_merge`]); this module only guarantees the envelope and
//! that records cross block boundaries transparently.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::KmtricksError;
use crate::lz4_stream::{Sink, Source};

/// ASCII "KMTRXPF1" read as a little-endian `u64`.
pub const MAGIC: u64 = 0x3146_5058_5254_4D4B;

/// Current on-disk format version. Bumped whenever a header layout changes
/// in a way that is not backward compatible.
pub const FORMAT_VERSION: u32 = 1;

/// The count width selected at run start: increments saturate at the
/// maximum representable value and never wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountWidth {
    U8,
    U16,
    U32,
}

impl CountWidth {
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::U8 => u8::MAX as u64,
            Self::U16 => u16::MAX as u64,
            Self::U32 => u32::MAX as u64,
        }
    }

    /// Encodes `value` (already saturated by the caller) into `self.bytes()`
    /// little-endian bytes.
    pub fn encode(self, value: u64, out: &mut Vec<u8>) {
        match self {
            Self::U8 => out.push(value.min(u64::from(u8::MAX)) as u8),
            Self::U16 => out.extend_from_slice(&(value.min(u64::from(u16::MAX)) as u16).to_le_bytes()),
            Self::U32 => out.extend_from_slice(&(value.min(u64::from(u32::MAX)) as u32).to_le_bytes()),
        }
    }

    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> u64 {
        match self {
            Self::U8 => u64::from(bytes[0]),
            Self::U16 => u64::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            Self::U32 => u64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        }
    }

    /// Saturating add used by every counting strategy.
    #[must_use]
    pub fn saturating_add(self, current: u64, delta: u64) -> u64 {
        current.saturating_add(delta).min(self.max_value())
    }
}

/// One of the 8 on-disk record kinds this crate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    KmerCount = 0,
    HashCount = 1,
    MatrixCount = 2,
    MatrixHashCount = 3,
    PaMatrix = 4,
    PaMatrixHash = 5,
    Vector = 6,
    Hist = 7,
}

impl FileKind {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::KmerCount,
            1 => Self::HashCount,
            2 => Self::MatrixCount,
            3 => Self::MatrixHashCount,
            4 => Self::PaMatrix,
            5 => Self::PaMatrixHash,
            6 => Self::Vector,
            7 => Self::Hist,
            _ => return None,
        })
    }
}

fn count_width_from_slots(slots: u8) -> Result<CountWidth, String> {
    match slots {
        1 => Ok(CountWidth::U8),
        2 => Ok(CountWidth::U16),
        4 => Ok(CountWidth::U32),
        other => Err(format!("invalid count_slots {other}, expected 1, 2, or 4")),
    }
}

macro_rules! header_kind {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $ty,)*
        }
    };
}

header_kind!(KmerCountHeader { k: u8, kmer_slots: u8, count_slots: u8, sample_id: u32, partition: u32 });
header_kind!(HashCountHeader { count_slots: u8, sample_id: u32, partition: u32 });
header_kind!(MatrixCountHeader { k: u8, kmer_slots: u8, count_slots: u8, nb_samples: u32, id: u32, partition: u32 });
header_kind!(MatrixHashCountHeader { count_slots: u8, nb_samples: u32, id: u32, partition: u32 });
header_kind!(PaMatrixHeader { k: u8, kmer_slots: u8, bits: u32, bytes: u32, id: u32, partition: u32 });
header_kind!(PaMatrixHashHeader { bits: u32, bytes: u32, id: u32, partition: u32 });
header_kind!(VectorHeader { bits: u32, id: u32, partition: u32, lower_hash: u64, count: u32 });
header_kind!(HistHeader { sample_id: u32, k: u8 });

/// The kind-specific header fields, tagged by [`FileKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileHeader {
    KmerCount(KmerCountHeader),
    HashCount(HashCountHeader),
    MatrixCount(MatrixCountHeader),
    MatrixHashCount(MatrixHashCountHeader),
    PaMatrix(PaMatrixHeader),
    PaMatrixHash(PaMatrixHashHeader),
    Vector(VectorHeader),
    Hist(HistHeader),
}

impl FileHeader {
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        match self {
            Self::KmerCount(_) => FileKind::KmerCount,
            Self::HashCount(_) => FileKind::HashCount,
            Self::MatrixCount(_) => FileKind::MatrixCount,
            Self::MatrixHashCount(_) => FileKind::MatrixHashCount,
            Self::PaMatrix(_) => FileKind::PaMatrix,
            Self::PaMatrixHash(_) => FileKind::PaMatrixHash,
            Self::Vector(_) => FileKind::Vector,
            Self::Hist(_) => FileKind::Hist,
        }
    }

    /// Length in bytes of one fixed-size record under this header. Every
    /// kind this crate supports has a record length fully determined by
    /// its header.
    #[must_use]
    pub fn record_len(&self) -> usize {
        match self {
            Self::KmerCount(h) => h.kmer_slots as usize * 8 + h.count_slots as usize,
            Self::HashCount(h) => 8 + h.count_slots as usize,
            Self::MatrixCount(h) => {
                h.kmer_slots as usize * 8 + h.count_slots as usize * h.nb_samples as usize
            }
            Self::MatrixHashCount(h) => 8 + h.count_slots as usize * h.nb_samples as usize,
            Self::PaMatrix(h) => h.kmer_slots as usize * 8 + h.bytes as usize,
            Self::PaMatrixHash(h) => 8 + h.bytes as usize,
            Self::Vector(h) => h.bits.div_ceil(8) as usize,
            Self::Hist(_) => 8, // one u64 count per call to write_record
        }
    }

    fn write_fields(&self, out: &mut Vec<u8>) {
        match self {
            Self::KmerCount(h) => {
                out.push(h.k);
                out.push(h.kmer_slots);
                out.push(h.count_slots);
                out.extend_from_slice(&h.sample_id.to_le_bytes());
                out.extend_from_slice(&h.partition.to_le_bytes());
            }
            Self::HashCount(h) => {
                out.push(h.count_slots);
                out.extend_from_slice(&h.sample_id.to_le_bytes());
                out.extend_from_slice(&h.partition.to_le_bytes());
            }
            Self::MatrixCount(h) => {
                out.push(h.k);
                out.push(h.kmer_slots);
                out.push(h.count_slots);
                out.extend_from_slice(&h.nb_samples.to_le_bytes());
                out.extend_from_slice(&h.id.to_le_bytes());
                out.extend_from_slice(&h.partition.to_le_bytes());
            }
            Self::MatrixHashCount(h) => {
                out.push(h.count_slots);
                out.extend_from_slice(&h.nb_samples.to_le_bytes());
                out.extend_from_slice(&h.id.to_le_bytes());
                out.extend_from_slice(&h.partition.to_le_bytes());
            }
            Self::PaMatrix(h) => {
                out.push(h.k);
                out.push(h.kmer_slots);
                out.extend_from_slice(&h.bits.to_le_bytes());
                out.extend_from_slice(&h.bytes.to_le_bytes());
                out.extend_from_slice(&h.id.to_le_bytes());
                out.extend_from_slice(&h.partition.to_le_bytes());
            }
            Self::PaMatrixHash(h) => {
                out.extend_from_slice(&h.bits.to_le_bytes());
                out.extend_from_slice(&h.bytes.to_le_bytes());
                out.extend_from_slice(&h.id.to_le_bytes());
                out.extend_from_slice(&h.partition.to_le_bytes());
            }
            Self::Vector(h) => {
                out.extend_from_slice(&h.bits.to_le_bytes());
                out.extend_from_slice(&h.id.to_le_bytes());
                out.extend_from_slice(&h.partition.to_le_bytes());
                out.extend_from_slice(&h.lower_hash.to_le_bytes());
                out.extend_from_slice(&h.count.to_le_bytes());
            }
            Self::Hist(h) => {
                out.extend_from_slice(&h.sample_id.to_le_bytes());
                out.push(h.k);
            }
        }
    }

    fn read_fields<R: Read>(kind: FileKind, r: &mut R) -> io::Result<Self> {
        Ok(match kind {
            FileKind::KmerCount => {
                let (k, kmer_slots, count_slots) = read_u8_u8_u8(r)?;
                let (sample_id, partition) = read_u32_u32(r)?;
                Self::KmerCount(KmerCountHeader { k, kmer_slots, count_slots, sample_id, partition })
            }
            FileKind::HashCount => {
                let count_slots = read_u8(r)?;
                let (sample_id, partition) = read_u32_u32(r)?;
                Self::HashCount(HashCountHeader { count_slots, sample_id, partition })
            }
            FileKind::MatrixCount => {
                let (k, kmer_slots, count_slots) = read_u8_u8_u8(r)?;
                let nb_samples = read_u32(r)?;
                let (id, partition) = read_u32_u32(r)?;
                Self::MatrixCount(MatrixCountHeader { k, kmer_slots, count_slots, nb_samples, id, partition })
            }
            FileKind::MatrixHashCount => {
                let count_slots = read_u8(r)?;
                let nb_samples = read_u32(r)?;
                let (id, partition) = read_u32_u32(r)?;
                Self::MatrixHashCount(MatrixHashCountHeader { count_slots, nb_samples, id, partition })
            }
            FileKind::PaMatrix => {
                let (k, kmer_slots) = (read_u8(r)?, read_u8(r)?);
                let bits = read_u32(r)?;
                let bytes = read_u32(r)?;
                let (id, partition) = read_u32_u32(r)?;
                Self::PaMatrix(PaMatrixHeader { k, kmer_slots, bits, bytes, id, partition })
            }
            FileKind::PaMatrixHash => {
                let bits = read_u32(r)?;
                let bytes = read_u32(r)?;
                let (id, partition) = read_u32_u32(r)?;
                Self::PaMatrixHash(PaMatrixHashHeader { bits, bytes, id, partition })
            }
            FileKind::Vector => {
                let bits = read_u32(r)?;
                let (id, partition) = read_u32_u32(r)?;
                let mut buf8 = [0u8; 8];
                r.read_exact(&mut buf8)?;
                let lower_hash = u64::from_le_bytes(buf8);
                let count = read_u32(r)?;
                Self::Vector(VectorHeader { bits, id, partition, lower_hash, count })
            }
            FileKind::Hist => {
                let sample_id = read_u32(r)?;
                let k = read_u8(r)?;
                Self::Hist(HistHeader { sample_id, k })
            }
        })
    }
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u8_u8_u8<R: Read>(r: &mut R) -> io::Result<(u8, u8, u8)> {
    Ok((read_u8(r)?, read_u8(r)?, read_u8(r)?))
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u32_u32<R: Read>(r: &mut R) -> io::Result<(u32, u32)> {
    Ok((read_u32(r)?, read_u32(r)?))
}

/// Writes count-width fields as bytes for headers that carry `count_slots`,
/// used by callers that only know a [`CountWidth`] and not the raw u8.
#[must_use]
pub fn count_width_of(header: &FileHeader) -> Option<CountWidth> {
    let slots = match header {
        FileHeader::KmerCount(h) => h.count_slots,
        FileHeader::HashCount(h) => h.count_slots,
        FileHeader::MatrixCount(h) => h.count_slots,
        FileHeader::MatrixHashCount(h) => h.count_slots,
        _ => return None,
    };
    count_width_from_slots(slots).ok()
}

fn write_envelope<W: Write>(w: &mut W, header: &FileHeader, compressed: bool) -> io::Result<()> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.push(header.kind() as u8);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.push(u8::from(compressed));
    buf.extend_from_slice(&[0u8; 2]); // reserved padding
    header.write_fields(&mut buf);
    w.write_all(&buf)
}

fn read_envelope<R: Read>(path: &Path, r: &mut R) -> Result<(FileHeader, bool), KmtricksError> {
    let fmt = |e: io::Error| KmtricksError::io(path, e);
    let mut magic_buf = [0u8; 8];
    r.read_exact(&mut magic_buf).map_err(fmt)?;
    let magic = u64::from_le_bytes(magic_buf);
    if magic != MAGIC {
        return Err(KmtricksError::format(path, "bad magic"));
    }
    let kind_byte = read_u8(r).map_err(fmt)?;
    let kind = FileKind::from_u8(kind_byte)
        .ok_or_else(|| KmtricksError::format(path, format!("unknown file kind {kind_byte}")))?;
    let version = read_u32(r).map_err(fmt)?;
    if version != FORMAT_VERSION {
        return Err(KmtricksError::format(
            path,
            format!("version mismatch: file is v{version}, reader supports v{FORMAT_VERSION}"),
        ));
    }
    let compressed = read_u8(r).map_err(fmt)? != 0;
    let mut reserved = [0u8; 2];
    r.read_exact(&mut reserved).map_err(fmt)?;
    let header = FileHeader::read_fields(kind, r).map_err(fmt)?;
    Ok((header, compressed))
}

/// Writes the envelope, then exposes fixed-length record writes over the
/// raw or LZ4-framed payload stream.
pub struct PartitionWriter<W: Write> {
    header: FileHeader,
    record_len: usize,
    sink: Sink<W>,
}

impl<W: Write> PartitionWriter<W> {
    /// Writes the envelope and opens the payload sink.
    ///
    /// # Errors
    /// Returns an `io::Error` if the envelope cannot be written.
    pub fn new(mut inner: W, header: FileHeader, compressed: bool) -> io::Result<Self> {
        write_envelope(&mut inner, &header, compressed)?;
        let record_len = header.record_len();
        Ok(Self { header, record_len, sink: Sink::new(inner, compressed) })
    }

    #[must_use]
    pub const fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Writes one fixed-length record.
    ///
    /// # Errors
    /// Returns an `io::Error` if `record` doesn't match this file's record
    /// length, or on the underlying write failure.
    pub fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        if record.len() != self.record_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "record length {} does not match header-derived length {}",
                    record.len(),
                    self.record_len
                ),
            ));
        }
        self.sink.write_all(record)
    }

    /// Finalizes the compressed stream (if any) and returns the underlying
    /// writer. Failing to finalize is a fatal error -- callers must call
    /// this rather than drop the writer.
    ///
    /// # Errors
    /// Returns an `io::Error` if the final block cannot be flushed.
    pub fn finish(self) -> io::Result<W> {
        self.sink.finish()
    }
}

impl PartitionWriter<std::fs::File> {
    /// Creates a partition file at `path` with the given header.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] if the file cannot be created.
    pub fn create(path: impl AsRef<Path>, header: FileHeader, compressed: bool) -> Result<Self, KmtricksError> {
        let path = path.as_ref();
        let file = std::fs::File::create(path).map_err(|e| KmtricksError::io(path, e))?;
        Self::new(file, header, compressed).map_err(|e| KmtricksError::io(path, e))
    }
}

/// Reads the envelope, then exposes fixed-length record reads.
pub struct PartitionReader<R: Read> {
    header: FileHeader,
    record_len: usize,
    source: Source<R>,
}

impl<R: Read> PartitionReader<R> {
    /// Reads and validates the envelope from `inner`, returning a reader
    /// positioned at the start of the payload.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Format`] on bad magic, version mismatch, or
    /// unknown kind; [`KmtricksError::Io`] on read failure.
    pub fn open_with_path(mut inner: R, path: &Path) -> Result<Self, KmtricksError> {
        let (header, compressed) = read_envelope(path, &mut inner)?;
        let record_len = header.record_len();
        Ok(Self { header, record_len, source: Source::new(inner, compressed) })
    }

    #[must_use]
    pub const fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Reads the next fixed-length record, or `None` at a clean EOF that
    /// falls exactly on a record boundary.
    ///
    /// # Errors
    /// Returns an `io::Error` for a truncated trailing record.
    pub fn read_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.record_len];
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record"))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Some(buf))
    }
}

impl PartitionReader<std::io::BufReader<std::fs::File>> {
    /// Opens and validates the partition file at `path`.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] if the file cannot be opened, or
    /// [`KmtricksError::Format`] if the envelope is invalid.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KmtricksError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path).map_err(|e| KmtricksError::io(&path, e))?;
        Self::open_with_path(std::io::BufReader::new(file), &path)
    }
}
