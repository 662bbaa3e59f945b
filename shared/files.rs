// ========================================================================================
//
//                     Shared file access and runtime plumbing
//
// ========================================================================================

use flate2::read::MultiGzDecoder;
use memchr::memchr_iter;
use natord::compare;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const LINE_COUNT_BUFFER: usize = 64 * 1024;

static RUNTIME_MANAGER: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Returns the process-wide Tokio runtime, creating it on first use.
pub fn get_shared_runtime() -> io::Result<Arc<Runtime>> {
    if let Some(runtime) = RUNTIME_MANAGER.get() {
        return Ok(Arc::clone(runtime));
    }

    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("pgs-tool-runner")
            .build()?,
    );

    // A concurrent initializer may have won the race; its runtime is the one kept.
    let _ = RUNTIME_MANAGER.set(Arc::clone(&runtime));
    Ok(RUNTIME_MANAGER.get().cloned().unwrap_or(runtime))
}

/// Opens a text file for buffered line reading, transparently decompressing gzip.
///
/// Compression is detected from the magic bytes rather than the extension, so a
/// `.txt.gz` that was already inflated by a proxy is still read correctly.
pub fn open_text_source(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let peeked = read_prefix(&mut file, &mut magic)?;
    let file = File::open(path)?;

    if peeked == GZIP_MAGIC.len() && magic == GZIP_MAGIC {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Counts lines the way `wc -l` would, plus one for a trailing line without a newline.
pub fn count_lines(path: &Path) -> io::Result<u64> {
    let mut reader = File::open(path)?;
    let mut buffer = vec![0u8; LINE_COUNT_BUFFER];
    let mut lines = 0u64;
    let mut last_byte = None;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        lines += memchr_iter(b'\n', &buffer[..read]).count() as u64;
        last_byte = Some(buffer[read - 1]);
    }

    if matches!(last_byte, Some(b) if b != b'\n') {
        lines += 1;
    }
    Ok(lines)
}

/// Orders paths by file name using natural ordering (`chr2` before `chr10`).
pub fn compare_paths(a: &Path, b: &Path) -> std::cmp::Ordering {
    let a_str = a
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| a.to_string_lossy().into_owned());
    let b_str = b
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| b.to_string_lossy().into_owned());
    compare(&a_str, &b_str)
}

/// Lists the regular files directly inside `dir` carrying `extension`, in natural order.
pub fn files_with_extension(dir: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            entries.push(path);
        }
    }
    entries.sort_by(|a, b| compare_paths(a, b));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn count_lines_handles_missing_trailing_newline() {
        let dir = tempdir().unwrap();
        let with_newline = dir.path().join("a.txt");
        let without_newline = dir.path().join("b.txt");
        let empty = dir.path().join("c.txt");
        fs::write(&with_newline, "x\ny\nz\n").unwrap();
        fs::write(&without_newline, "x\ny\nz").unwrap();
        fs::write(&empty, "").unwrap();

        assert_eq!(count_lines(&with_newline).unwrap(), 3);
        assert_eq!(count_lines(&without_newline).unwrap(), 3);
        assert_eq!(count_lines(&empty).unwrap(), 0);
    }

    #[test]
    fn open_text_source_inflates_gzip_by_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scores.txt.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"chr_name\tchr_position\n1\t100\n").unwrap();
        encoder.finish().unwrap();

        let lines: Vec<String> = open_text_source(&path)
            .unwrap()
            .lines()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(lines, vec!["chr_name\tchr_position", "1\t100"]);
    }

    #[test]
    fn files_with_extension_uses_natural_order() {
        let dir = tempdir().unwrap();
        for name in ["chr10.pgen", "chr2.pgen", "chr1.pvar", "notes.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let found = files_with_extension(dir.path(), "pgen").unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["chr2.pgen", "chr10.pgen"]);
    }
}
