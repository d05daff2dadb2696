use std::{
    fs::{File, OpenOptions, create_dir_all},
    io::{BufRead, BufReader, Write},
    path::Path,
};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::HarnessError;

fn io_error(path: &Path, source: std::io::Error) -> HarnessError {
    HarnessError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> HarnessError {
    HarnessError::Json {
        path: path.to_path_buf(),
        source,
    }
}

pub fn load_json_lines(file_path: impl AsRef<Path>) -> Result<Vec<serde_json::Value>, HarnessError> {
    load_json_lines_as(file_path)
}

/// Reads a JSON-lines file, skipping blank lines.
pub fn load_json_lines_as<T: DeserializeOwned>(
    file_path: impl AsRef<Path>,
) -> Result<Vec<T>, HarnessError> {
    let path = file_path.as_ref();
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let reader = BufReader::new(file);

    let mut results = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| io_error(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let item: T = serde_json::from_str(&line).map_err(|e| json_error(path, e))?;
        results.push(item);
    }
    Ok(results)
}

pub fn write_json_lines_to_file<T: Serialize>(
    file_path: impl AsRef<Path>,
    results: &[T],
) -> Result<(), HarnessError> {
    let path = file_path.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }

    let mut file = File::create(path).map_err(|e| io_error(path, e))?;
    for result in results {
        let line = serde_json::to_string(result).map_err(|e| json_error(path, e))?;
        writeln!(file, "{}", line).map_err(|e| io_error(path, e))?;
    }
    file.flush().map_err(|e| io_error(path, e))?;

    Ok(())
}

/// Appends one record, creating the file and its parents if needed.
pub fn append_json_line<T: Serialize>(
    file_path: impl AsRef<Path>,
    record: &T,
) -> Result<(), HarnessError> {
    let path = file_path.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error(path, e))?;
    let line = serde_json::to_string(record).map_err(|e| json_error(path, e))?;
    writeln!(file, "{}", line).map_err(|e| io_error(path, e))?;
    Ok(())
}

pub fn write_json_pretty<T: Serialize>(
    file_path: impl AsRef<Path>,
    value: &T,
) -> Result<(), HarnessError> {
    let path = file_path.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|e| json_error(path, e))?;
    std::fs::write(path, text).map_err(|e| io_error(path, e))
}

pub fn read_json<T: DeserializeOwned>(file_path: impl AsRef<Path>) -> Result<T, HarnessError> {
    let path = file_path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    serde_json::from_str(&text).map_err(|e| json_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_lines_append_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        append_json_line(&path, &json!({"id": "simple_python_0"})).unwrap();
        append_json_line(&path, &json!({"id": "simple_python_1"})).unwrap();
        let loaded = load_json_lines(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1]["id"], "simple_python_1");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_json_lines(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, HarnessError::Io { .. }));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaps.json");
        std::fs::write(&path, "{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        assert_eq!(load_json_lines(&path).unwrap().len(), 2);
    }
}
