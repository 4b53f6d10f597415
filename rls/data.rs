//! # Matrix Loading and Writing
//!
//! Feature and target matrices are plain delimited text: one sample per row,
//! one column per feature (or output). Files ending in `.tsv` are tab
//! separated, everything else is comma separated. An optional header row is
//! skipped. Every field must parse as an `f64`; ragged rows are
//! rejected with the offending row number.

use ndarray::{Array2, ArrayView2};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed delimited input: {0}")]
    Csv(#[from] csv::Error),

    #[error("Row {row} has {found} fields, but the first row has {expected}.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Could not parse '{value}' at row {row}, column {column} as a number.")]
    Parse {
        row: usize,
        column: usize,
        value: String,
    },

    #[error("Input '{0}' contains no data rows.")]
    Empty(String),

    #[error("Could not assemble matrix: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    }
}

/// Loads a numeric matrix from `path`, choosing the delimiter from its extension.
pub fn load_matrix(path: impl AsRef<Path>, has_headers: bool) -> Result<Array2<f64>, DataError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let matrix = read_matrix(file, delimiter_for(path), has_headers).map_err(|e| match e {
        DataError::Empty(_) => DataError::Empty(path.display().to_string()),
        other => other,
    })?;
    log::debug!(
        "Loaded {} x {} matrix from {}",
        matrix.nrows(),
        matrix.ncols(),
        path.display()
    );
    Ok(matrix)
}

pub fn read_matrix<R: Read>(reader: R, delimiter: u8, has_headers: bool) -> Result<Array2<f64>, DataError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut values = Vec::new();
    let mut ncols = None;
    let mut nrows = 0usize;
    for (idx, record) in csv_reader.records().enumerate() {
        let record = record?;
        let row = idx + 1;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        let expected = *ncols.get_or_insert(record.len());
        if record.len() != expected {
            return Err(DataError::RaggedRow {
                row,
                expected,
                found: record.len(),
            });
        }
        for (column, field) in record.iter().enumerate() {
            let value = field.parse::<f64>().map_err(|_| DataError::Parse {
                row,
                column: column + 1,
                value: field.to_string(),
            })?;
            values.push(value);
        }
        nrows += 1;
    }

    let ncols = match ncols {
        Some(ncols) if nrows > 0 => ncols,
        _ => return Err(DataError::Empty("input".to_string())),
    };
    Ok(Array2::from_shape_vec((nrows, ncols), values)?)
}

/// Writes `matrix` to `path`, one sample per line.
pub fn write_matrix(path: impl AsRef<Path>, matrix: ArrayView2<f64>) -> Result<(), DataError> {
    let path = path.as_ref();
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter_for(path))
        .from_path(path)?;
    for row in matrix.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn reads_comma_and_tab_separated_input() {
        let csv_text = "1.0, 2.5\n-3,4e-2\n";
        let m = read_matrix(csv_text.as_bytes(), b',', false).unwrap();
        assert_eq!(m, array![[1.0, 2.5], [-3.0, 0.04]]);

        let tsv_text = "x1\tx2\n0\t1\n2\t3\n";
        let m = read_matrix(tsv_text.as_bytes(), b'\t', true).unwrap();
        assert_eq!(m, array![[0.0, 1.0], [2.0, 3.0]]);
    }

    #[test]
    fn reports_ragged_rows_and_bad_numbers() {
        match read_matrix("1,2\n3\n".as_bytes(), b',', false).unwrap_err() {
            DataError::RaggedRow {
                row,
                expected,
                found,
            } => {
                assert_eq!((row, expected, found), (2, 2, 1));
            }
            other => panic!("Expected RaggedRow, got {other:?}"),
        }
        match read_matrix("1,2\n3,abc\n".as_bytes(), b',', false).unwrap_err() {
            DataError::Parse { row, column, value } => {
                assert_eq!((row, column), (2, 2));
                assert_eq!(value, "abc");
            }
            other => panic!("Expected Parse, got {other:?}"),
        }
        assert!(matches!(
            read_matrix("a,b\n".as_bytes(), b',', true),
            Err(DataError::Empty(_))
        ));
    }

    #[test]
    fn written_files_load_back() {
        let dir = tempdir().unwrap();
        let m = array![[0.125, -7.0], [1e-9, 3.5]];
        for name in ["m.csv", "m.tsv"] {
            let path = dir.path().join(name);
            write_matrix(&path, m.view()).unwrap();
            assert_eq!(load_matrix(&path, false).unwrap(), m);
        }
        assert_eq!(delimiter_for(Path::new("a/b.TSV")), b'\t');
        assert_eq!(delimiter_for(Path::new("a/b.txt")), b',');
    }
}
