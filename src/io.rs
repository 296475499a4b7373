//! Ambient file plumbing for the CLI and tests: reading Newick tree files
//! (optionally gzip-compressed) through the external parser, and writing
//! labelled TSV tables.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use phylotree::tree::Tree;

use crate::error::{PhyloError, Result};

/// Strip bracketed annotations like :[&rate=0.123]2.45 while preserving the
/// branch lengths; some tree dumps carry them on every edge.
fn strip_annotations(newick: &str) -> String {
    let mut result = String::with_capacity(newick.len());
    let mut depth = 0usize;
    for ch in newick.chars() {
        match ch {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => result.push(ch),
            _ => {}
        }
    }
    result
}

fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if path.to_string_lossy().ends_with(".gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Reads a file with one Newick tree per line (blank lines skipped, `.gz`
/// handled transparently) and parses each through `phylotree`. Tree names
/// are `{basename}_tree{index}`.
pub fn read_newick_trees<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Tree)>> {
    let path = path.as_ref();
    let base_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.trim_end_matches(".gz").trim_end_matches(".nwk").trim_end_matches(".trees"))
        .unwrap_or("unknown")
        .to_string();

    let reader = open_maybe_gz(path)?;
    let mut trees = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let newick = strip_annotations(line);
        let tree = Tree::from_newick(&newick).map_err(|e| {
            PhyloError::Parse(format!("{}:{}: {e}", path.display(), lineno + 1))
        })?;
        trees.push((format!("{base_name}_tree{}", trees.len()), tree));
    }
    if trees.is_empty() {
        return Err(PhyloError::Parse(format!("no trees found in {}", path.display())));
    }
    Ok(trees)
}

/// Writes a labelled table as TSV: one header row of column names, then one
/// row per entry. If `path` ends with `.gz` the output is gzip-compressed.
pub fn write_table_tsv<P: AsRef<Path>, T: std::fmt::Display>(
    path: P,
    col_names: &[&str],
    row_names: &[String],
    rows: &[Vec<T>],
) -> Result<()> {
    let p = path.as_ref();
    let is_gz = p.to_string_lossy().ends_with(".gz");
    let mut out: Box<dyn Write> = if is_gz {
        let f = File::create(p)?;
        Box::new(BufWriter::new(GzEncoder::new(f, Compression::default())))
    } else {
        Box::new(BufWriter::new(File::create(p)?))
    };

    for name in col_names {
        write!(&mut out, "\t{name}")?;
    }
    writeln!(&mut out)?;
    for (name, row) in row_names.iter().zip(rows) {
        write!(&mut out, "{name}")?;
        for val in row {
            write!(&mut out, "\t{val}")?;
        }
        writeln!(&mut out)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_are_stripped_but_lengths_kept() {
        let s = strip_annotations("((A:[&rate=0.1]1.5,B:2):[&x={1,2}]0.5,C:1);");
        assert_eq!(s, "((A:1.5,B:2):0.5,C:1);");
    }

    #[test]
    fn reads_plain_newick_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join("phylodist_io_test.nwk");
        std::fs::write(&path, "((A,B),C);\n\n((A,C),B);\n").unwrap();
        let trees = read_newick_trees(&path).unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].0, "phylodist_io_test_tree0");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn empty_file_is_an_error() {
        let dir = std::env::temp_dir();
        let path = dir.join("phylodist_io_empty.nwk");
        std::fs::write(&path, "\n").unwrap();
        assert!(read_newick_trees(&path).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn table_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join("phylodist_io_table.tsv");
        write_table_tsv(
            &path,
            &["dup", "los"],
            &["g0".to_string(), "g1".to_string()],
            &[vec![1, 2], vec![0, 0]],
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "\tdup\tlos\ng0\t1\t2\ng1\t0\t0\n");
        std::fs::remove_file(&path).ok();
    }
}
