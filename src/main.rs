#![allow(clippy::too_many_lines)]

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use bio::io::{fasta, fastq};
use clap::Parser;
use colored::Colorize;

use kmerust::cli::{Cli, CombineArgs, Command, CountArgs, FilterArgs, MatrixShape, MergeArgs};
use kmerust::counter::{count_partition, filter_abundance, write_kmer_counts, CountStrategy};
use kmerust::envelope::{CountWidth, FileHeader, PartitionReader};
use kmerust::error::KmtricksError;
use kmerust::format::SequenceFormat;
use kmerust::histogram::{compute_histogram, Histogram};
use kmerust::layout::{RunConfig, RunContext};
use kmerust::matrix::decode_count_row;
use kmerust::matrix_filter::{filter_matrix, render_vec_out};
use kmerust::matrix_merge::{merge_count_matrices, require_mergeable};
use kmerust::merger::{
    merge_partition, write_count_matrix, write_matrix_hash_count, write_pa_matrix, write_pa_matrix_hash,
    write_sample_vectors,
};
use kmerust::minimizer::{extract_super_kmers, MinimizerOrder};
use kmerust::pipeline::Scheduler;
use kmerust::pool::TaskPool;
use kmerust::progress::ProgressTracker;
use kmerust::repartition::{MinimizerOrderKind, RepartitionTable};
use kmerust::samples::{load_descriptor, Sample};
use kmerust::skm_store::{PartitionCaches, SuperKmerBinReader, SuperKmerBinStore};

/// Set `RUST_LOG=kmerust=debug` to see debug output.
#[cfg(feature = "tracing")]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn main() {
    #[cfg(feature = "tracing")]
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Count(args) => run_count(&args),
        Command::Merge(args) => run_merge(&args),
        Command::Combine(args) => run_combine(&args),
        Command::Filter(args) => run_filter(&args),
    };

    if let Err(e) = result {
        eprintln!("{}\n {}", "error:".red().bold(), e.diagnostic());
        process::exit(1);
    }
}

fn read_sequences(files: &[PathBuf]) -> Result<Vec<Vec<u8>>, KmtricksError> {
    let mut sequences = Vec::new();
    for path in files {
        if SequenceFormat::Auto.resolve(Some(path)).is_fastq() {
            let reader = fastq::Reader::from_file(path).map_err(|e| KmtricksError::io(path, e))?;
            for record in reader.records() {
                let record = record.map_err(|e| KmtricksError::format(path, e.to_string()))?;
                sequences.push(record.seq().to_vec());
            }
        } else {
            let reader = fasta::Reader::from_file(path).map_err(|e| KmtricksError::io(path, e))?;
            for record in reader.records() {
                let record = record.map_err(|e| KmtricksError::format(path, e.to_string()))?;
                sequences.push(record.seq().to_vec());
            }
        }
    }
    Ok(sequences)
}

/// Cap on how many sequences are loaded to build the repartition table: the
/// table only needs a representative sample of each sample's k-mer
/// composition, not the entire corpus held in memory at once.
const REPARTITION_SAMPLE_CAP: usize = 2_000_000;

/// Draws a bounded sample of sequences across every sample (~5% of each,
/// capped overall) to build the repartition table from, instead of loading
/// every sequence of every sample into memory at once.
fn sample_sequences_for_repartition(samples: &[Sample]) -> Result<Vec<Vec<u8>>, KmtricksError> {
    let mut sampled = Vec::new();
    'samples: for sample in samples {
        let seqs = read_sequences(&sample.files)?;
        let take = (seqs.len() / 20).max(seqs.len().min(1));
        for seq in seqs.into_iter().take(take) {
            sampled.push(seq);
            if sampled.len() >= REPARTITION_SAMPLE_CAP {
                break 'samples;
            }
        }
    }
    Ok(sampled)
}

/// Tracks one binning task's in-flight status against [`Scheduler`]'s cap,
/// throttling the scheduler down (once) the first time a binning task
/// actually has to wait for a slot.
fn acquire_binning_slot(gate: &(Mutex<usize>, Condvar), scheduler: &Scheduler, throttled_once: &AtomicBool, total_workers: usize) {
    let (lock, cvar) = gate;
    let mut in_flight = lock.lock().expect("binning gate mutex poisoned");
    loop {
        let cap = scheduler.max_running();
        if *in_flight < cap {
            *in_flight += 1;
            return;
        }
        if cap == total_workers && !throttled_once.swap(true, Ordering::SeqCst) {
            scheduler.throttle();
            continue;
        }
        in_flight = cvar.wait(in_flight).expect("binning gate mutex poisoned");
    }
}

fn release_binning_slot(gate: &(Mutex<usize>, Condvar)) {
    let (lock, cvar) = gate;
    let mut in_flight = lock.lock().expect("binning gate mutex poisoned");
    *in_flight -= 1;
    cvar.notify_all();
}

/// Per-sample accumulator shared by that sample's P counting tasks: each
/// merges its partition's histogram in and decrements `remaining`; whoever
/// hits zero finalizes the sample (writes its histogram, resolves
/// `abundance_min`).
struct SampleCountState {
    histogram: Mutex<Histogram>,
    remaining: AtomicUsize,
}

fn count_one_partition(
    ctx: &RunContext,
    sample_dir_id: &str,
    sample_id: u32,
    partition: u32,
    k: usize,
    k_u8: u8,
    width: CountWidth,
    max_count: Option<u64>,
) -> Result<Histogram, KmtricksError> {
    let mut reader = SuperKmerBinReader::open(ctx.sample_superkmers_dir(sample_dir_id), partition as usize)?;
    let counts = count_partition(&mut reader, k, CountStrategy::HashAggregate)?;
    let histogram = compute_histogram(counts.iter().map(|&(_, c)| c));
    // The merger may rescue a sample's sub-threshold count (see
    // save_if in `merge`), so only the upper bound is applied here.
    let bounded = filter_abundance(&counts, 0, max_count);

    let path = ctx.count_file_path(sample_dir_id, partition);
    let file = File::create(&path).map_err(|e| KmtricksError::io(&path, e))?;
    write_kmer_counts(file, &bounded, k_u8, width, sample_id, partition).map_err(|e| KmtricksError::io(&path, e))?;
    Ok(histogram)
}

fn run_count(args: &CountArgs) -> Result<(), KmtricksError> {
    let samples = load_descriptor(&args.descriptor)?;
    let ctx = RunContext::new(&args.run_dir);
    ctx.create_layout()?;

    let order_kind = if args.frequency_order { MinimizerOrderKind::Frequency } else { MinimizerOrderKind::Lexicographic };

    let sampled = sample_sequences_for_repartition(&samples)?;
    let table = Arc::new(RepartitionTable::build(
        sampled.iter().map(Vec::as_slice),
        args.k,
        args.m,
        args.partitions,
        order_kind,
    ));
    table.save(ctx.repartition_table_path())?;
    let order = Arc::new(table.minimizer_order());
    let width: CountWidth = args.width.into();
    let k_u8 = u8::try_from(args.k).expect("k-mer length already validated to fit in a u8");
    let k = args.k;
    let m = args.m;
    let partitions = args.partitions;
    let max_count = args.max_count;

    let threads = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let scheduler = Arc::new(Scheduler::new(threads, 0.5));
    let pool = TaskPool::new(threads);
    let gate: Arc<(Mutex<usize>, Condvar)> = Arc::new((Mutex::new(0), Condvar::new()));
    let throttled_once = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(ProgressTracker::new());
    let abundance_mins: Arc<Mutex<BTreeMap<String, u32>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let errors: Arc<Mutex<Vec<KmtricksError>>> = Arc::new(Mutex::new(Vec::new()));

    let run_default_min_count = args.min_count;
    let start = Instant::now();

    for (idx, sample) in samples.iter().cloned().enumerate() {
        let sample_id = u32::try_from(idx).expect("sample count fits a u32");
        let ctx = ctx.clone();
        let table = Arc::clone(&table);
        let order = Arc::clone(&order);
        let progress = Arc::clone(&progress);
        let gate = Arc::clone(&gate);
        let scheduler = Arc::clone(&scheduler);
        let throttled_once = Arc::clone(&throttled_once);
        let errors = Arc::clone(&errors);
        let abundance_mins = Arc::clone(&abundance_mins);
        let handle = pool.handle();

        pool.submit(move || {
            acquire_binning_slot(&gate, &scheduler, &throttled_once, threads);
            let bin_result = bin_sample(&ctx, &sample, &table, &order, k, m, &progress);
            release_binning_slot(&gate);

            if let Err(e) = bin_result {
                errors.lock().expect("error list mutex poisoned").push(e);
                return;
            }
            if let Err(e) = std::fs::create_dir_all(ctx.sample_counts_dir(&sample.id)) {
                errors.lock().expect("error list mutex poisoned").push(KmtricksError::io(ctx.sample_counts_dir(&sample.id), e));
                return;
            }

            // Completion callback: this sample's binning finished, so its P
            // counting tasks can be enqueued now.
            let state = Arc::new(SampleCountState { histogram: Mutex::new(Histogram::new()), remaining: AtomicUsize::new(partitions as usize) });
            for partition in 0..partitions {
                let ctx = ctx.clone();
                let sample = sample.clone();
                let errors = Arc::clone(&errors);
                let abundance_mins = Arc::clone(&abundance_mins);
                let state = Arc::clone(&state);
                handle.submit(move || {
                    match count_one_partition(&ctx, &sample.id, sample_id, partition, k, k_u8, width, max_count) {
                        Ok(histogram) => {
                            state.histogram.lock().expect("sample histogram mutex poisoned").merge(&histogram);
                        }
                        Err(e) => {
                            errors.lock().expect("error list mutex poisoned").push(e);
                        }
                    }

                    if state.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
                        return;
                    }
                    // Last partition for this sample: finalize.
                    let histogram = state.histogram.lock().expect("sample histogram mutex poisoned").clone();
                    let resolved = sample.abundance_min.resolve(run_default_min_count, &histogram);
                    abundance_mins.lock().expect("abundance_min map mutex poisoned").insert(sample.id.clone(), resolved);

                    let hist_path = ctx.histogram_path(&sample.id);
                    let result = File::create(&hist_path)
                        .map_err(|e| KmtricksError::io(&hist_path, e))
                        .and_then(|file| histogram.write_to(file, sample_id, k_u8).map_err(|e| KmtricksError::io(&hist_path, e)));
                    if let Err(e) = result {
                        errors.lock().expect("error list mutex poisoned").push(e);
                    }
                });
            }
        });
    }
    pool.shutdown();
    ctx.append_run_info("count", start.elapsed())?;

    if let Some(first) = errors.lock().expect("error list mutex poisoned").drain(..).next() {
        return Err(first);
    }

    let snapshot = progress.snapshot();
    eprintln!(
        "{}: {} sequences, {} bases binned and counted in {:.1}s",
        "count".bold(),
        snapshot.sequences_processed,
        snapshot.bases_processed,
        start.elapsed().as_secs_f64(),
    );

    let sample_abundance_min = Arc::try_unwrap(abundance_mins)
        .expect("every pool job has finished and dropped its Arc clone")
        .into_inner()
        .expect("abundance_min map mutex poisoned");

    ctx.write_config(&RunConfig {
        k: args.k,
        m: args.m,
        partitions: args.partitions,
        nb_samples: samples.len(),
        minimizer_type: if args.frequency_order { "frequency".to_string() } else { "lexicographic".to_string() },
        count_width_bytes: u8::try_from(width.bytes()).expect("count width bytes fit in a u8"),
        min_count: run_default_min_count,
        max_count: args.max_count,
        min_recurrence: 1,
        sample_abundance_min,
    })?;

    eprintln!(
        "{}: {} samples, {} partitions, k={}",
        "count".bold(),
        samples.len().to_string().blue().bold(),
        args.partitions.to_string().blue().bold(),
        args.k.to_string().blue().bold(),
    );
    Ok(())
}

fn bin_sample(
    ctx: &RunContext,
    sample: &Sample,
    table: &RepartitionTable,
    order: &MinimizerOrder,
    k: usize,
    m: usize,
    progress: &ProgressTracker,
) -> Result<(), KmtricksError> {
    let store = SuperKmerBinStore::create(ctx.sample_superkmers_dir(&sample.id), table.partitions as usize)?;
    let mut caches = PartitionCaches::new(&store, 1 << 16);
    for seq in read_sequences(&sample.files)? {
        progress.record_sequence(seq.len() as u64);
        for sk in extract_super_kmers(&seq, k, m, order) {
            let partition = table.partition_of(sk.minimizer_bits) as usize;
            caches.insert_super_kmer(partition, sk.n_k, &sk.packed)?;
        }
    }
    caches.flush_all()?;
    store.finalize()
}

fn list_sample_ids(ctx: &RunContext) -> Result<Vec<String>, KmtricksError> {
    let dir = ctx.counts_dir();
    let mut ids: Vec<String> = std::fs::read_dir(&dir)
        .map_err(|e| KmtricksError::io(&dir, e))?
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    ids.sort();
    Ok(ids)
}

fn read_config(ctx: &RunContext) -> Result<RunConfig, KmtricksError> {
    let path = ctx.run_config_path();
    let text = std::fs::read_to_string(&path).map_err(|e| KmtricksError::io(&path, e))?;
    Ok(serde_json::from_str(&text)?)
}

fn count_width_from_bytes(bytes: u8) -> CountWidth {
    match bytes {
        1 => CountWidth::U8,
        2 => CountWidth::U16,
        _ => CountWidth::U32,
    }
}

fn shape_label(shape: MatrixShape) -> &'static str {
    match shape {
        MatrixShape::CountMatrix => "count_matrix",
        MatrixShape::PaMatrix => "pa_matrix",
        MatrixShape::MatrixHashCount => "matrix_hash_count",
        MatrixShape::PaMatrixHash => "pa_matrix_hash",
        MatrixShape::Vector => "vector",
    }
}

fn run_merge(args: &MergeArgs) -> Result<(), KmtricksError> {
    let ctx = RunContext::new(&args.run_dir);
    let config = read_config(&ctx)?;
    let width: CountWidth = args.width.into();
    let k_u8 = u8::try_from(config.k).expect("k-mer length fits in a u8");

    let sample_ids = list_sample_ids(&ctx)?;
    let nb_samples = u32::try_from(sample_ids.len()).expect("sample count fits a u32");
    let mut readers = Vec::with_capacity(sample_ids.len());
    let mut abundance_min = Vec::with_capacity(sample_ids.len());
    for sample_id in &sample_ids {
        readers.push(PartitionReader::open(ctx.count_file_path(sample_id, args.partition))?);
        abundance_min.push(*config.sample_abundance_min.get(sample_id).unwrap_or(&config.min_count));
    }

    let (rows, stats) = merge_partition(readers, width, &abundance_min, args.min_recurrence, args.save_if)?;
    eprintln!(
        "{}: kept {}, dropped {}, rescued {}",
        "merge".bold(),
        stats.rows_kept,
        stats.rows_dropped_by_recurrence,
        stats.rows_rescued_by_save_if
    );

    match args.shape {
        MatrixShape::Vector => {
            let mut index = 0usize;
            write_sample_vectors(
                |_| {
                    let sample_id = &sample_ids[index];
                    index += 1;
                    let path = ctx.matrix_file_path(&format!("vector_{sample_id}"), args.partition);
                    File::create(&path)
                },
                &rows,
                sample_ids.len(),
                0,
                args.partition,
            )
            .map_err(|e| KmtricksError::io(ctx.matrices_dir(), e))?;
        }
        shape => {
            let out_path = ctx.matrix_file_path(shape_label(shape), args.partition);
            let file = File::create(&out_path).map_err(|e| KmtricksError::io(&out_path, e))?;
            match shape {
                MatrixShape::CountMatrix => {
                    write_count_matrix(file, &rows, k_u8, width, nb_samples, 0, args.partition)
                        .map_err(|e| KmtricksError::io(&out_path, e))?;
                }
                MatrixShape::PaMatrix => {
                    write_pa_matrix(file, &rows, k_u8, nb_samples, 0, args.partition)
                        .map_err(|e| KmtricksError::io(&out_path, e))?;
                }
                MatrixShape::MatrixHashCount => {
                    write_matrix_hash_count(file, &rows, config.k, width, nb_samples, 0, args.partition)
                        .map_err(|e| KmtricksError::io(&out_path, e))?;
                }
                MatrixShape::PaMatrixHash => {
                    write_pa_matrix_hash(file, &rows, config.k, nb_samples, 0, args.partition)
                        .map_err(|e| KmtricksError::io(&out_path, e))?;
                }
                MatrixShape::Vector => unreachable!("handled above"),
            }
        }
    }
    Ok(())
}

fn run_combine(args: &CombineArgs) -> Result<(), KmtricksError> {
    let mut tables = Vec::with_capacity(args.runs.len());
    let mut sample_counts = Vec::with_capacity(args.runs.len());
    let mut readers = Vec::with_capacity(args.runs.len());
    let mut shared_k = None;
    let mut shared_width = None;

    for run_dir in &args.runs {
        let ctx = RunContext::new(run_dir);
        tables.push(RepartitionTable::load(ctx.repartition_table_path())?);
        let config = read_config(&ctx)?;
        shared_k.get_or_insert(config.k);
        shared_width.get_or_insert(count_width_from_bytes(config.count_width_bytes));
        sample_counts.push(config.nb_samples);

        let matrix_path = ctx.matrix_file_path(shape_label(MatrixShape::CountMatrix), args.partition);
        readers.push(PartitionReader::open(&matrix_path)?);
    }
    require_mergeable(&tables)?;

    let width = shared_width.unwrap_or(CountWidth::U32);
    let k = shared_k.unwrap_or(0);
    let rows = merge_count_matrices(readers, &sample_counts, width)?;
    let total_samples = u32::try_from(sample_counts.iter().sum::<usize>()).expect("combined sample count fits a u32");

    let file = File::create(&args.output).map_err(|e| KmtricksError::io(&args.output, e))?;
    write_count_matrix(file, &rows, u8::try_from(k).expect("k-mer length fits in a u8"), width, total_samples, 0, args.partition)
        .map_err(|e| KmtricksError::io(&args.output, e))?;
    eprintln!("{}: {} rows across {} runs", "combine".bold(), rows.len(), args.runs.len());
    Ok(())
}

/// Reads an entire `KmerCount` stream (a `count` run's per-partition output
/// for one sample) into memory, sorted ascending as written.
fn read_kmer_counts(path: &PathBuf) -> Result<Vec<(u64, u64)>, KmtricksError> {
    let mut reader = PartitionReader::open(path)?;
    let FileHeader::KmerCount(header) = *reader.header() else {
        return Err(KmtricksError::input("filter's new-sample file must be a KmerCount file"));
    };
    let width = count_width_from_bytes(header.count_slots);
    let mut counts = Vec::new();
    while let Some(record) = reader.read_record().map_err(|e| KmtricksError::io(path, e))? {
        let bits = u64::from_le_bytes(record[0..8].try_into().expect("8-byte kmer slot"));
        counts.push((bits, width.decode(&record[8..])));
    }
    Ok(counts)
}

fn run_filter(args: &FilterArgs) -> Result<(), KmtricksError> {
    let mut reader = PartitionReader::open(&args.matrix)?;
    let FileHeader::MatrixCount(header) = *reader.header() else {
        return Err(KmtricksError::input("filter only supports count-matrix files"));
    };
    let nb_samples = header.nb_samples as usize;
    let width = count_width_from_bytes(header.count_slots);

    let mut rows = Vec::new();
    while let Some(record) = reader.read_record().map_err(|e| KmtricksError::io(&args.matrix, e))? {
        rows.push(decode_count_row(&record, nb_samples, width));
    }

    let new_sample = read_kmer_counts(&args.new_sample)?;
    let result = filter_matrix(&rows, &new_sample);
    eprintln!(
        "{}: {} matrix rows, {} new k-mers absent from the matrix",
        "filter".bold(),
        result.matrix_out.len(),
        result.kmer_out.len(),
    );

    let out_nb_samples = header.nb_samples + 1;
    let file = File::create(&args.matrix_out).map_err(|e| KmtricksError::io(&args.matrix_out, e))?;
    write_count_matrix(file, &result.matrix_out, header.k, width, out_nb_samples, header.id, header.partition)
        .map_err(|e| KmtricksError::io(&args.matrix_out, e))?;

    std::fs::write(&args.vec_out, render_vec_out(&result.vec_out)).map_err(|e| KmtricksError::io(&args.vec_out, e))?;

    let kmer_out_text: String = result.kmer_out.iter().map(|(bits, count)| format!("{bits}\t{count}\n")).collect();
    std::fs::write(&args.kmer_out, kmer_out_text).map_err(|e| KmtricksError::io(&args.kmer_out, e))?;

    Ok(())
}
