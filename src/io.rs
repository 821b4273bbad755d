use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::contract::{BitstreamSource, FrameSink, PipelineError};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

fn io_error(context: impl Into<String>, source: std::io::Error) -> PipelineError {
    PipelineError::Io {
        context: context.into(),
        source,
    }
}

/// Serves an in-memory stream in fixed-size chunks.
#[derive(Debug, Clone)]
pub struct MemorySource {
    chunks: VecDeque<Vec<u8>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(data: &[u8], chunk_size: usize) -> Self {
        let chunks = data
            .chunks(chunk_size.max(1))
            .map(<[u8]>::to_vec)
            .collect();
        Self { chunks }
    }
}

impl BitstreamSource for MemorySource {
    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        Ok(self.chunks.pop_front())
    }
}

#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: File,
    chunk_size: usize,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|err| io_error(format!("failed to open {}", path.display()), err))?;
        Ok(Self {
            path,
            file,
            chunk_size: chunk_size.max(1),
        })
    }
}

impl BitstreamSource for FileSource {
    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        let mut chunk = vec![0u8; self.chunk_size];
        let read = self
            .file
            .read(&mut chunk)
            .map_err(|err| io_error(format!("failed to read {}", self.path.display()), err))?;
        if read == 0 {
            return Ok(None);
        }
        chunk.truncate(read);
        Ok(Some(chunk))
    }
}

/// Collects output into a buffer that stays readable after the sink has
/// been handed to a pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn write_count(&self) -> usize {
        *self
            .writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameSink for MemorySink {
    fn write_output(&mut self, data: &[u8]) -> Result<(), PipelineError> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(data);
        *self
            .writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .map_err(|err| io_error(format!("failed to create {}", path.display()), err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }
}

impl FrameSink for FileSink {
    fn write_output(&mut self, data: &[u8]) -> Result<(), PipelineError> {
        self.writer
            .write_all(data)
            .map_err(|err| io_error(format!("failed to write {}", self.path.display()), err))
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.writer
            .flush()
            .map_err(|err| io_error(format!("failed to flush {}", self.path.display()), err))
    }
}

/// Discards everything; useful for throughput runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn write_output(&mut self, _data: &[u8]) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_splits_into_chunks() {
        let mut source = MemorySource::new(&[1, 2, 3, 4, 5], 2);
        assert_eq!(source.read_chunk().unwrap(), Some(vec![1, 2]));
        assert_eq!(source.read_chunk().unwrap(), Some(vec![3, 4]));
        assert_eq!(source.read_chunk().unwrap(), Some(vec![5]));
        assert_eq!(source.read_chunk().unwrap(), None);
    }

    #[test]
    fn memory_sink_is_shared_between_clones() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write_output(b"ab").unwrap();
        writer.write_output(b"cd").unwrap();
        assert_eq!(sink.contents(), b"abcd");
        assert_eq!(sink.write_count(), 2);
    }

    #[test]
    fn file_round_trip() {
        let dir = std::env::temp_dir().join(format!("video-hw-pipeline-io-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.bin");

        let mut sink = FileSink::create(&path).unwrap();
        sink.write_output(b"hello ").unwrap();
        sink.write_output(b"world").unwrap();
        sink.finish().unwrap();

        let mut source = FileSource::open(&path, 4).unwrap();
        let mut read = Vec::new();
        while let Some(chunk) = source.read_chunk().unwrap() {
            read.extend_from_slice(&chunk);
        }
        assert_eq!(read, b"hello world");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_reports_context() {
        let err = FileSource::open("/definitely/not/here.bin", 16).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.bin"));
    }
}
