//! Per-sample, per-partition super-k-mer bin store.
//!
//! One directory per sample holds one append-only file `skp.<p>` per
//! partition. Writers never touch a file directly: a per-writer
//! [`PartitionCaches`] buffers inserts in memory and flushes each
//! partition's buffer as one length-framed block
//! (`[block_len:u32][(n_k:u8, packed_bytes)*]`) through [`SuperKmerBinStore`],
//! which holds the one mutex-per-partition that makes block appends atomic.
//! Readers ([`SuperKmerBinReader`]) pull the same blocks back in insertion
//! order.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::KmtricksError;

fn partition_file_path(sample_dir: &Path, partition: usize) -> PathBuf {
    sample_dir.join(format!("skp.{partition}"))
}

/// Owns one append-only file per partition for a single sample, each guarded
/// by its own mutex so cache flushes from different threads never interleave.
pub struct SuperKmerBinStore {
    sample_dir: PathBuf,
    files: Vec<Mutex<BufWriter<File>>>,
    super_kmer_counts: Vec<AtomicU64>,
    byte_counts: Vec<AtomicU64>,
}

impl SuperKmerBinStore {
    /// Creates the sample directory (if needed) and opens one file per
    /// partition for appending.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] if the directory or files cannot be
    /// created.
    pub fn create(sample_dir: impl Into<PathBuf>, partitions: usize) -> Result<Self, KmtricksError> {
        let sample_dir = sample_dir.into();
        std::fs::create_dir_all(&sample_dir).map_err(|e| KmtricksError::io(&sample_dir, e))?;
        let mut files = Vec::with_capacity(partitions);
        for p in 0..partitions {
            let path = partition_file_path(&sample_dir, p);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| KmtricksError::io(&path, e))?;
            files.push(Mutex::new(BufWriter::new(file)));
        }
        Ok(Self {
            sample_dir,
            files,
            super_kmer_counts: (0..partitions).map(|_| AtomicU64::new(0)).collect(),
            byte_counts: (0..partitions).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn sample_dir(&self) -> &Path {
        &self.sample_dir
    }

    /// Appends one already-framed block to `partition`'s file. `n_super_kmers`
    /// and the block's byte length feed the info-file counters.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Pipeline`] if `partition` is out of range,
    /// or [`KmtricksError::Io`] on write failure.
    pub fn write_block(&self, partition: usize, block: &[u8], n_super_kmers: u64) -> Result<(), KmtricksError> {
        let guard = self.files.get(partition).ok_or_else(|| {
            KmtricksError::pipeline(format!("partition {partition} out of range (have {})", self.files.len()))
        })?;
        #[allow(clippy::cast_possible_truncation)]
        let len = block.len() as u32;
        let mut writer = guard.lock().expect("bin store mutex poisoned");
        writer
            .write_all(&len.to_le_bytes())
            .and_then(|()| writer.write_all(block))
            .map_err(|e| KmtricksError::io(partition_file_path(&self.sample_dir, partition), e))?;
        self.super_kmer_counts[partition].fetch_add(n_super_kmers, Ordering::Relaxed);
        self.byte_counts[partition].fetch_add(block.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes every partition's writer and persists the two info files
    /// (`PartiInfoFile`, `SuperKmerBinInfoFile`).
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] if any file cannot be flushed or the
    /// info files cannot be written.
    pub fn finalize(&self) -> Result<(), KmtricksError> {
        for (p, guard) in self.files.iter().enumerate() {
            let mut writer = guard.lock().expect("bin store mutex poisoned");
            writer
                .flush()
                .map_err(|e| KmtricksError::io(partition_file_path(&self.sample_dir, p), e))?;
        }
        self.write_parti_info()?;
        self.write_bin_info()
    }

    fn write_parti_info(&self) -> Result<(), KmtricksError> {
        let path = self.sample_dir.join("PartiInfoFile");
        let mut text = format!("file_count\t{}\n", self.files.len());
        for p in 0..self.files.len() {
            text.push_str(&format!(
                "{p}\t{}\t{}\n",
                self.super_kmer_counts[p].load(Ordering::Relaxed),
                self.byte_counts[p].load(Ordering::Relaxed),
            ));
        }
        std::fs::write(&path, text).map_err(|e| KmtricksError::io(path, e))
    }

    fn write_bin_info(&self) -> Result<(), KmtricksError> {
        let path = self.sample_dir.join("SuperKmerBinInfoFile");
        let total_super_kmers: u64 = self.super_kmer_counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        let total_bytes: u64 = self.byte_counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        let text = format!(
            "partitions\t{}\ntotal_super_kmers\t{total_super_kmers}\ntotal_bytes\t{total_bytes}\n",
            self.files.len()
        );
        std::fs::write(&path, text).map_err(|e| KmtricksError::io(path, e))
    }

    #[must_use]
    pub fn super_kmer_count(&self, partition: usize) -> u64 {
        self.super_kmer_counts[partition].load(Ordering::Relaxed)
    }
}

/// A per-writer (per thread or per sample) buffer in front of a
/// [`SuperKmerBinStore`]. Sized in bytes: each partition's buffer is flushed
/// as one block once it would exceed `cap_bytes`.
pub struct PartitionCaches<'a> {
    store: &'a SuperKmerBinStore,
    buffers: Vec<Vec<u8>>,
    pending_counts: Vec<u64>,
    cap_bytes: usize,
}

impl<'a> PartitionCaches<'a> {
    #[must_use]
    pub fn new(store: &'a SuperKmerBinStore, cap_bytes: usize) -> Self {
        let partitions = store.partitions();
        Self {
            store,
            buffers: (0..partitions).map(|_| Vec::new()).collect(),
            pending_counts: vec![0; partitions],
            cap_bytes,
        }
    }

    /// Appends one super-k-mer (`n_k` byte followed by its packed bytes) to
    /// `partition`'s buffer, flushing first if the buffer is already at
    /// capacity.
    ///
    /// # Errors
    /// Propagates [`SuperKmerBinStore::write_block`] errors.
    pub fn insert_super_kmer(&mut self, partition: usize, n_k: u8, packed: &[u8]) -> Result<(), KmtricksError> {
        if self.buffers[partition].len() + 1 + packed.len() > self.cap_bytes && !self.buffers[partition].is_empty() {
            self.flush(partition)?;
        }
        self.buffers[partition].push(n_k);
        self.buffers[partition].extend_from_slice(packed);
        self.pending_counts[partition] += 1;
        Ok(())
    }

    fn flush(&mut self, partition: usize) -> Result<(), KmtricksError> {
        if self.buffers[partition].is_empty() {
            return Ok(());
        }
        self.store
            .write_block(partition, &self.buffers[partition], self.pending_counts[partition])?;
        self.buffers[partition].clear();
        self.pending_counts[partition] = 0;
        Ok(())
    }

    /// Flushes every partition's buffer. Must be called once the writer is
    /// done producing super-k-mers, before [`SuperKmerBinStore::finalize`].
    ///
    /// # Errors
    /// Propagates [`SuperKmerBinStore::write_block`] errors.
    pub fn flush_all(&mut self) -> Result<(), KmtricksError> {
        for p in 0..self.buffers.len() {
            self.flush(p)?;
        }
        Ok(())
    }
}

/// Reads blocks back from one partition's bin file in insertion order.
pub struct SuperKmerBinReader {
    reader: BufReader<File>,
}

impl SuperKmerBinReader {
    /// Opens `sample_dir/skp.<partition>` for reading.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] if the file cannot be opened.
    pub fn open(sample_dir: impl AsRef<Path>, partition: usize) -> Result<Self, KmtricksError> {
        let path = partition_file_path(sample_dir.as_ref(), partition);
        let file = File::open(&path).map_err(|e| KmtricksError::io(path, e))?;
        Ok(Self { reader: BufReader::new(file) })
    }

    /// Reads the next block into `buf`, resizing it to the block's length.
    /// Returns `false` at a clean EOF.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Format`] on a truncated block.
    pub fn read_block(&mut self, buf: &mut Vec<u8>) -> Result<bool, KmtricksError> {
        let mut len_buf = [0u8; 4];
        match read_or_eof(&mut self.reader, &mut len_buf)? {
            false => Ok(false),
            true => {
                let len = u32::from_le_bytes(len_buf) as usize;
                buf.resize(len, 0);
                self.reader
                    .read_exact(buf)
                    .map_err(|_| KmtricksError::format("skp bin", "truncated block"))?;
                Ok(true)
            }
        }
    }

    /// Decodes one block's super-k-mers into `(n_k, packed_bytes)` pairs.
    /// `n_bases = k + n_k - 1`, so the packed byte length is
    /// `ceil(n_bases*2/8)` and depends on the caller's `k`.
    #[must_use]
    pub fn decode_block(block: &[u8], k: usize) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let n_k = block[pos];
            pos += 1;
            let n_bases = k + n_k as usize - 1;
            let n_bytes = (n_bases * 2).div_ceil(8);
            out.push((n_k, block[pos..pos + n_bytes].to_vec()));
            pos += n_bytes;
        }
        out
    }
}

fn read_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, KmtricksError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(KmtricksError::format("skp bin", "truncated block header")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(KmtricksError::io(PathBuf::new(), e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip_single_partition() {
        let dir = tempdir().unwrap();
        let store = SuperKmerBinStore::create(dir.path(), 2).unwrap();
        {
            let mut caches = PartitionCaches::new(&store, 1024);
            caches.insert_super_kmer(0, 3, &[0xAA, 0xBB]).unwrap();
            caches.insert_super_kmer(0, 5, &[0xCC, 0xDD, 0xEE]).unwrap();
            caches.flush_all().unwrap();
        }
        store.finalize().unwrap();

        let mut reader = SuperKmerBinReader::open(dir.path(), 0).unwrap();
        let mut block = Vec::new();
        assert!(reader.read_block(&mut block).unwrap());
        assert_eq!(block, vec![3, 0xAA, 0xBB, 5, 0xCC, 0xDD, 0xEE]);
        assert!(!reader.read_block(&mut block).unwrap());
    }

    #[test]
    fn cache_flushes_when_over_capacity() {
        let dir = tempdir().unwrap();
        let store = SuperKmerBinStore::create(dir.path(), 1).unwrap();
        {
            // cap is tiny, so every insert should force its own flush
            let mut caches = PartitionCaches::new(&store, 3);
            for i in 0..5u8 {
                caches.insert_super_kmer(0, 1, &[i]).unwrap();
            }
            caches.flush_all().unwrap();
        }
        store.finalize().unwrap();

        let mut reader = SuperKmerBinReader::open(dir.path(), 0).unwrap();
        let mut blocks = Vec::new();
        let mut block = Vec::new();
        while reader.read_block(&mut block).unwrap() {
            blocks.push(block.clone());
        }
        let all: Vec<u8> = blocks.concat();
        assert_eq!(all, vec![1, 0, 1, 1, 1, 2, 1, 3, 1, 4]);
    }

    #[test]
    fn info_files_report_counts() {
        let dir = tempdir().unwrap();
        let store = SuperKmerBinStore::create(dir.path(), 2).unwrap();
        {
            let mut caches = PartitionCaches::new(&store, 1024);
            caches.insert_super_kmer(0, 1, &[1]).unwrap();
            caches.insert_super_kmer(1, 1, &[2]).unwrap();
            caches.insert_super_kmer(1, 1, &[3]).unwrap();
            caches.flush_all().unwrap();
        }
        store.finalize().unwrap();
        assert_eq!(store.super_kmer_count(0), 1);
        assert_eq!(store.super_kmer_count(1), 2);
        assert!(dir.path().join("PartiInfoFile").exists());
        assert!(dir.path().join("SuperKmerBinInfoFile").exists());
    }

    #[test]
    fn decode_block_splits_super_kmers() {
        // k=4, n_k=1 -> n_bases=4 -> 1 byte; n_k=2 -> n_bases=5 -> 2 bytes
        let block = vec![1, 0xAB, 2, 0xCD, 0xEF];
        let decoded = SuperKmerBinReader::decode_block(&block, 4);
        assert_eq!(decoded, vec![(1, vec![0xAB]), (2, vec![0xCD, 0xEF])]);
    }

    #[test]
    fn write_block_rejects_out_of_range_partition() {
        let dir = tempdir().unwrap();
        let store = SuperKmerBinStore::create(dir.path(), 1).unwrap();
        let err = store.write_block(5, &[0], 1).unwrap_err();
        assert!(matches!(err, KmtricksError::Pipeline(_)));
    }
}
