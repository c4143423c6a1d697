#![allow(clippy::unwrap_used, clippy::expect_used, clippy::too_many_lines)]

use std::fs;
use std::process::Command;

use kmerust::envelope::{FileHeader, PartitionReader};
use kmerust::matrix::decode_count_row;

fn kmerust_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kmerust"))
}

fn write_descriptor(dir: &std::path::Path, samples: &[(&str, &str)]) -> std::path::PathBuf {
    let mut text = String::new();
    let mut paths = Vec::new();
    for (id, seq) in samples {
        let fasta_path = dir.join(format!("{id}.fa"));
        fs::write(&fasta_path, format!(">{id}\n{seq}\n")).unwrap();
        text.push_str(&format!("{id}: {}\n", fasta_path.display()));
        paths.push(fasta_path);
    }
    let descriptor_path = dir.join("samples.fof");
    fs::write(&descriptor_path, text).unwrap();
    descriptor_path
}

const SEQ_A: &str = "ACGTACGGTTACGGTTACGTACGGATTACGGCATTACGGA";
const SEQ_B: &str = "TTGGCCAATTGGCCAATTGGCCTTAACCGGTTAACCGGAA";

#[test]
fn cli_help_flag() {
    let output = kmerust_cmd().arg("--help").output().expect("failed to execute");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("kmerust"));
    assert!(stdout.contains("count"));
    assert!(stdout.contains("merge"));
    assert!(stdout.contains("combine"));
    assert!(stdout.contains("filter"));
}

#[test]
fn cli_version_flag() {
    let output = kmerust_cmd().arg("--version").output().expect("failed to execute");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn cli_missing_subcommand() {
    let output = kmerust_cmd().output().expect("failed to execute");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage") || stderr.contains("required"));
}

#[test]
fn cli_count_rejects_k_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let descriptor = write_descriptor(tmp.path(), &[("a", SEQ_A)]);
    let run_dir = tmp.path().join("run");
    let output = kmerust_cmd()
        .arg("count")
        .arg(&descriptor)
        .args(["-k", "0", "-m", "2", "-p", "1", "-d"])
        .arg(&run_dir)
        .output()
        .expect("failed to execute");
    assert!(!output.status.success());
}

#[test]
fn cli_count_rejects_k_too_large() {
    let tmp = tempfile::tempdir().unwrap();
    let descriptor = write_descriptor(tmp.path(), &[("a", SEQ_A)]);
    let run_dir = tmp.path().join("run");
    let output = kmerust_cmd()
        .arg("count")
        .arg(&descriptor)
        .args(["-k", "33", "-m", "2", "-p", "1", "-d"])
        .arg(&run_dir)
        .output()
        .expect("failed to execute");
    assert!(!output.status.success());
}

#[test]
fn cli_count_missing_descriptor_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = tmp.path().join("run");
    let output = kmerust_cmd()
        .arg("count")
        .arg(tmp.path().join("nonexistent.fof"))
        .args(["-k", "4", "-m", "2", "-p", "1", "-d"])
        .arg(&run_dir)
        .output()
        .expect("failed to execute");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"));
}

#[test]
fn cli_count_creates_run_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let descriptor = write_descriptor(tmp.path(), &[("sampleA", SEQ_A), ("sampleB", SEQ_B)]);
    let run_dir = tmp.path().join("run");

    let output = kmerust_cmd()
        .arg("count")
        .arg(&descriptor)
        .args(["-k", "4", "-m", "2", "-p", "3", "-d"])
        .arg(&run_dir)
        .output()
        .expect("failed to execute");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    assert!(run_dir.join("options.txt").exists());
    assert!(run_dir.join("config_gatb/run_config.json").exists());
    assert!(run_dir.join("repartition_gatb/repartition.minimRepart").exists());
    for partition in 0..3 {
        assert!(run_dir.join(format!("counts/sampleA/kmer_count.{partition}")).exists());
        assert!(run_dir.join(format!("counts/sampleB/kmer_count.{partition}")).exists());
    }
    assert!(run_dir.join("histograms/sampleA.hist").exists());
    assert!(run_dir.join("histograms/sampleB.hist").exists());
}

#[test]
fn cli_merge_produces_count_matrix_with_all_partitions_routed() {
    let tmp = tempfile::tempdir().unwrap();
    let descriptor = write_descriptor(tmp.path(), &[("sampleA", SEQ_A), ("sampleB", SEQ_B)]);
    let run_dir = tmp.path().join("run");

    // A single partition guarantees every k-mer lands in partition 0.
    let count_output = kmerust_cmd()
        .arg("count")
        .arg(&descriptor)
        .args(["-k", "4", "-m", "2", "-p", "1", "-d"])
        .arg(&run_dir)
        .output()
        .expect("failed to execute count");
    assert!(count_output.status.success(), "stderr: {}", String::from_utf8_lossy(&count_output.stderr));

    let merge_output = kmerust_cmd()
        .arg("merge")
        .args(["-d"])
        .arg(&run_dir)
        .args(["-p", "0", "--shape", "count-matrix"])
        .output()
        .expect("failed to execute merge");
    assert!(merge_output.status.success(), "stderr: {}", String::from_utf8_lossy(&merge_output.stderr));

    let matrix_path = run_dir.join("matrices/count_matrix_0");
    assert!(matrix_path.exists());

    let mut reader = PartitionReader::<std::io::BufReader<std::fs::File>>::open(&matrix_path).unwrap();
    let FileHeader::MatrixCount(header) = *reader.header() else {
        panic!("expected a count-matrix header");
    };
    assert_eq!(header.nb_samples, 2);
    assert_eq!(header.k, 4);

    let mut rows = Vec::new();
    while let Some(record) = reader.read_record().unwrap() {
        rows.push(decode_count_row(&record, header.nb_samples as usize, kmerust::envelope::CountWidth::U32));
    }
    assert!(!rows.is_empty(), "samples with 40+ bases of sequence should produce 4-mers");
    // Rows must be sorted ascending by canonical k-mer bits.
    for pair in rows.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }
}

#[test]
fn cli_merge_pa_matrix_shape_has_no_count_column() {
    let tmp = tempfile::tempdir().unwrap();
    let descriptor = write_descriptor(tmp.path(), &[("sampleA", SEQ_A), ("sampleB", SEQ_B)]);
    let run_dir = tmp.path().join("run");

    kmerust_cmd()
        .arg("count")
        .arg(&descriptor)
        .args(["-k", "4", "-m", "2", "-p", "1", "-d"])
        .arg(&run_dir)
        .output()
        .expect("failed to execute count");

    let merge_output = kmerust_cmd()
        .arg("merge")
        .args(["-d"])
        .arg(&run_dir)
        .args(["-p", "0", "--shape", "pa-matrix"])
        .output()
        .expect("failed to execute merge");
    assert!(merge_output.status.success());
    assert!(run_dir.join("matrices/pa_matrix_0").exists());
}

#[test]
fn cli_filter_adds_a_third_sample_as_a_new_column() {
    let tmp = tempfile::tempdir().unwrap();
    let descriptor = write_descriptor(tmp.path(), &[("sampleA", SEQ_A), ("sampleB", SEQ_B)]);
    let run_dir = tmp.path().join("run");

    kmerust_cmd()
        .arg("count")
        .arg(&descriptor)
        .args(["-k", "4", "-m", "2", "-p", "1", "-d"])
        .arg(&run_dir)
        .output()
        .expect("failed to execute count");
    kmerust_cmd()
        .arg("merge")
        .args(["-d"])
        .arg(&run_dir)
        .args(["-p", "0", "--shape", "count-matrix"])
        .output()
        .expect("failed to execute merge");

    // A second, independent `count` run over a third sample produces the
    // new sample's per-partition KmerCount file `filter` folds in.
    let new_sample_descriptor = write_descriptor(&tmp.path().join("new_sample_input"), &[("sampleC", SEQ_A)]);
    let new_sample_run_dir = tmp.path().join("new_sample_run");
    kmerust_cmd()
        .arg("count")
        .arg(&new_sample_descriptor)
        .args(["-k", "4", "-m", "2", "-p", "1", "-d"])
        .arg(&new_sample_run_dir)
        .output()
        .expect("failed to execute count for the new sample");

    let matrix_out = tmp.path().join("matrix_out.bin");
    let vec_out = tmp.path().join("vec_out.txt");
    let kmer_out = tmp.path().join("kmer_out.txt");

    let filter_output = kmerust_cmd()
        .arg("filter")
        .arg(run_dir.join("matrices/count_matrix_0"))
        .arg(new_sample_run_dir.join("counts/sampleC/kmer_count.0"))
        .args(["--matrix-out"])
        .arg(&matrix_out)
        .args(["--vec-out"])
        .arg(&vec_out)
        .args(["--kmer-out"])
        .arg(&kmer_out)
        .output()
        .expect("failed to execute filter");
    assert!(filter_output.status.success(), "stderr: {}", String::from_utf8_lossy(&filter_output.stderr));

    let mut reader = PartitionReader::<std::io::BufReader<std::fs::File>>::open(&matrix_out).unwrap();
    let FileHeader::MatrixCount(header) = *reader.header() else {
        panic!("expected a count-matrix header");
    };
    assert_eq!(header.nb_samples, 3);

    let mut rows = Vec::new();
    while let Some(record) = reader.read_record().unwrap() {
        rows.push(decode_count_row(&record, header.nb_samples as usize, kmerust::envelope::CountWidth::U32));
    }
    assert!(!rows.is_empty());
    for (_, counts) in &rows {
        assert_eq!(counts.len(), 3);
    }

    let vec_text = fs::read_to_string(&vec_out).unwrap();
    assert_eq!(vec_text.lines().count(), rows.len());

    // sampleC's sequence is identical to sampleA's, so every one of its
    // k-mers already exists in the matrix: nothing should land in kmer_out.
    let kmer_out_text = fs::read_to_string(&kmer_out).unwrap();
    assert!(kmer_out_text.is_empty());
}

#[test]
fn cli_combine_concatenates_sample_columns_across_runs() {
    let tmp = tempfile::tempdir().unwrap();

    let descriptor_1 = write_descriptor(&tmp.path().join("in1"), &[("sampleA", SEQ_A)]);
    let run_dir_1 = tmp.path().join("run1");
    let descriptor_2 = write_descriptor(&tmp.path().join("in2"), &[("sampleB", SEQ_B)]);
    let run_dir_2 = tmp.path().join("run2");

    for (descriptor, run_dir) in [(&descriptor_1, &run_dir_1), (&descriptor_2, &run_dir_2)] {
        // Partitions = 1 with lexicographic order makes every run's
        // repartition table identical (a single all-zero partition map)
        // regardless of which sequences built it, so these two
        // independently-run samples remain combinable.
        let output = kmerust_cmd()
            .arg("count")
            .arg(descriptor)
            .args(["-k", "4", "-m", "2", "-p", "1", "-d"])
            .arg(run_dir)
            .output()
            .expect("failed to execute count");
        assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

        let merge_output = kmerust_cmd()
            .arg("merge")
            .args(["-d"])
            .arg(run_dir)
            .args(["-p", "0", "--shape", "count-matrix"])
            .output()
            .expect("failed to execute merge");
        assert!(merge_output.status.success(), "stderr: {}", String::from_utf8_lossy(&merge_output.stderr));
    }

    let combined_path = tmp.path().join("combined.bin");
    let combine_output = kmerust_cmd()
        .arg("combine")
        .arg(&run_dir_1)
        .arg(&run_dir_2)
        .args(["-p", "0", "-o"])
        .arg(&combined_path)
        .output()
        .expect("failed to execute combine");
    assert!(combine_output.status.success(), "stderr: {}", String::from_utf8_lossy(&combine_output.stderr));

    let mut reader = PartitionReader::<std::io::BufReader<std::fs::File>>::open(&combined_path).unwrap();
    let FileHeader::MatrixCount(header) = *reader.header() else {
        panic!("expected a count-matrix header");
    };
    assert_eq!(header.nb_samples, 2, "combine should concatenate one column per run's sample");
}

#[test]
fn cli_combine_rejects_mismatched_repartition_tables() {
    let tmp = tempfile::tempdir().unwrap();

    let descriptor_1 = write_descriptor(&tmp.path().join("in1"), &[("sampleA", SEQ_A)]);
    let run_dir_1 = tmp.path().join("run1");
    kmerust_cmd()
        .arg("count")
        .arg(&descriptor_1)
        .args(["-k", "4", "-m", "2", "-p", "1", "-d"])
        .arg(&run_dir_1)
        .output()
        .expect("failed to execute count");
    kmerust_cmd()
        .arg("merge")
        .args(["-d"])
        .arg(&run_dir_1)
        .args(["-p", "0", "--shape", "count-matrix"])
        .output()
        .expect("failed to execute merge");

    let descriptor_2 = write_descriptor(&tmp.path().join("in2"), &[("sampleB", SEQ_B)]);
    let run_dir_2 = tmp.path().join("run2");
    kmerust_cmd()
        .arg("count")
        .arg(&descriptor_2)
        // A different m changes the repartition table's universe size,
        // making the two tables structurally incompatible.
        .args(["-k", "5", "-m", "3", "-p", "1", "-d"])
        .arg(&run_dir_2)
        .output()
        .expect("failed to execute count");
    kmerust_cmd()
        .arg("merge")
        .args(["-d"])
        .arg(&run_dir_2)
        .args(["-p", "0", "--shape", "count-matrix"])
        .output()
        .expect("failed to execute merge");

    let combined_path = tmp.path().join("combined.bin");
    let combine_output = kmerust_cmd()
        .arg("combine")
        .arg(&run_dir_1)
        .arg(&run_dir_2)
        .args(["-p", "0", "-o"])
        .arg(&combined_path)
        .output()
        .expect("failed to execute combine");
    assert!(!combine_output.status.success());
}
