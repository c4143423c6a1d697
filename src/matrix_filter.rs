//! Adding a new sample's counts as an extra column to an existing matrix.
//!
//! Both the matrix and the new sample's count stream are sorted ascending by
//! canonical k-mer bits, so [`filter_matrix`] co-iterates them with a
//! two-pointer walk rather than building a lookup set. It produces three
//! streams in one pass: the augmented matrix (`matrix_out`), the new
//! column's values alone in matrix order (`vec_out`, which a caller renders
//! with [`render_vec_out`] for the file on disk), and the k-mers the new
//! sample carries that the matrix didn't already have (`kmer_out`).

/// Result of one [`filter_matrix`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterResult {
    /// Every original matrix row, each with the new sample's value appended
    /// as one extra column (0 where the new sample lacked that k-mer).
    pub matrix_out: Vec<(u64, Vec<u64>)>,
    /// The new column alone, in the same row order as `matrix_out`.
    pub vec_out: Vec<u64>,
    /// K-mers the new sample has that the matrix didn't, ascending.
    pub kmer_out: Vec<(u64, u64)>,
}

/// Merges `new_sample` (sorted ascending `(kmer_bits, count)` pairs) into
/// `matrix` (sorted ascending `(kmer_bits, counts)` rows) as one extra
/// column.
#[must_use]
pub fn filter_matrix(matrix: &[(u64, Vec<u64>)], new_sample: &[(u64, u64)]) -> FilterResult {
    let mut matrix_out = Vec::with_capacity(matrix.len());
    let mut vec_out = Vec::with_capacity(matrix.len());
    let mut kmer_out = Vec::new();

    let mut i = 0;
    let mut j = 0;
    loop {
        match (matrix.get(i), new_sample.get(j)) {
            (Some((mb, counts)), Some(&(nb, nc))) => {
                if *mb == nb {
                    let mut row = counts.clone();
                    row.push(nc);
                    matrix_out.push((*mb, row));
                    vec_out.push(nc);
                    i += 1;
                    j += 1;
                } else if *mb < nb {
                    let mut row = counts.clone();
                    row.push(0);
                    matrix_out.push((*mb, row));
                    vec_out.push(0);
                    i += 1;
                } else {
                    kmer_out.push((nb, nc));
                    j += 1;
                }
            }
            (Some((mb, counts)), None) => {
                let mut row = counts.clone();
                row.push(0);
                matrix_out.push((*mb, row));
                vec_out.push(0);
                i += 1;
            }
            (None, Some(&(nb, nc))) => {
                kmer_out.push((nb, nc));
                j += 1;
            }
            (None, None) => break,
        }
    }

    FilterResult { matrix_out, vec_out, kmer_out }
}

/// Renders [`FilterResult::vec_out`] as the textual dump written to disk:
/// one decimal value per line, in matrix order.
#[must_use]
pub fn render_vec_out(vec_out: &[u64]) -> String {
    let mut text = String::new();
    for value in vec_out {
        text.push_str(&value.to_string());
        text.push('\n');
    }
    text
}
