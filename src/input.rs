//! Test case and seed input handling

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A single fuzz input with its lineage metadata
#[derive(Clone, Debug)]
pub struct TestCase {
    /// Input bytes handed to the target
    pub data: Vec<u8>,
    /// Originating file name or synthetic name
    pub name: String,
    /// Log of the mutations applied along the lineage
    pub mutations: String,
    /// Byte position at which deterministic mutation resumes
    pub start_byte_pos: Option<usize>,
    /// Bit position at which deterministic mutation resumes
    pub start_bit_pos: Option<u8>,
}

impl TestCase {
    /// Create a test case from raw bytes
    pub fn new(data: Vec<u8>, name: &str) -> Self {
        Self {
            data,
            name: name.to_string(),
            mutations: String::new(),
            start_byte_pos: None,
            start_bit_pos: None,
        }
    }

    /// Read a test case from a file, named after its basename
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("input"));

        Ok(Self::new(data, &name))
    }

    /// Write the input bytes to a file
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, &self.data)
    }
}

/// Enumerate the usable seed files inside the input directory
pub fn input_get_entries(input_dir: &Path) -> Result<Vec<PathBuf>, String> {
    if !input_dir.exists() {
        return Err(format!(
            "Cannot find the input directory specified: {:?}",
            input_dir
        ));
    }
    if !input_dir.is_dir() {
        return Err(format!(
            "The input directory specified is not a directory: {:?}",
            input_dir
        ));
    }

    let read_dir = fs::read_dir(input_dir).map_err(|error| format!("{}", error))?;

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                eprintln!("Failed to read dir entry: {}", error);
                continue;
            }
        };

        if !entry.path().is_file() {
            eprintln!("{:?} is not a regular file", entry.path());
            continue;
        }

        entries.push(entry.path());
    }

    // Directory order is not stable, runs should be
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::{input_get_entries, TestCase};

    use std::fs;
    use std::path::Path;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("raclette_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_clone_deep_copies_data() {
        let case = TestCase::new(b"abcd".to_vec(), "seed");
        let mut copy = case.clone();

        copy.data[0] = b'z';
        assert_eq!(case.data, b"abcd");
        assert_eq!(copy.data, b"zbcd");
    }

    #[test]
    fn test_load_names_after_basename() {
        let dir = scratch_dir("load");
        let path = dir.join("crash_me.bin");
        fs::write(&path, b"\x00\x01").unwrap();

        let case = TestCase::load_from(&path).unwrap();
        assert_eq!(case.name, "crash_me.bin");
        assert_eq!(case.data, b"\x00\x01");
        assert!(case.start_byte_pos.is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_write_round_trip() {
        let dir = scratch_dir("write");
        let path = dir.join("out");

        let case = TestCase::new(b"Hello World".to_vec(), "seed");
        case.write_to(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"Hello World");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_entries_sorted() {
        let dir = scratch_dir("entries");
        fs::write(dir.join("b"), b"b").unwrap();
        fs::write(dir.join("a"), b"a").unwrap();
        fs::create_dir(dir.join("subdir")).unwrap();

        let entries = input_get_entries(&dir).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("a"));
        assert!(entries[1].ends_with("b"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_directory_rejected() {
        assert!(input_get_entries(Path::new("/nonexistent/raclette")).is_err());
    }
}
