// Byte-range addressing over a shared read handle, and line-window search.
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bstr::ByteSlice;

use crate::core::error::{Error, ErrorKind};

const SCAN_BLOCK: usize = 8 * 1024;

/// An immutable `[begin, end)` range of a file opened for reading.
///
/// Derived segments share the same handle; the file is closed when the last
/// segment referencing it is dropped.
#[derive(Clone, Debug)]
pub struct FileSegment {
    file: Arc<File>,
    path: Arc<PathBuf>,
    begin: u64,
    end: u64,
    lines: Option<u32>,
}

impl FileSegment {
    /// Open `path` and address `[begin, end)`; `end` defaults to the file size.
    pub fn open(path: impl AsRef<Path>, begin: u64, end: Option<u64>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|err| Error::io(err, "failed to open file").with_path(&path))?;
        let meta = file
            .metadata()
            .map_err(|err| Error::io(err, "failed to stat file").with_path(&path))?;
        if meta.is_dir() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("path is a directory")
                .with_path(&path));
        }
        let size = meta.len();
        let end = end.unwrap_or(size);
        if end > size {
            return Err(Error::new(ErrorKind::InvalidRange)
                .with_message("end is past the end of file")
                .with_path(&path)
                .with_offset(end));
        }
        if begin > end {
            return Err(Error::new(ErrorKind::InvalidRange)
                .with_message("invalid position")
                .with_path(&path)
                .with_offset(begin));
        }
        Ok(Self {
            file: Arc::new(file),
            path: Arc::new(path),
            begin,
            end,
            lines: None,
        })
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Lines counted by the `find_lines` call that produced this segment.
    pub fn lines(&self) -> Option<u32> {
        self.lines
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// A segment from `position` to the end of this one.
    pub fn slice(&self, position: u64) -> Result<Self, Error> {
        if position > self.end {
            return Err(self.range_error("invalid position", position));
        }
        Ok(self.derive(position, self.end, None))
    }

    /// A segment of `len` bytes starting at `position`.
    pub fn slice_len(&self, position: u64, len: u64) -> Result<Self, Error> {
        if position > self.end {
            return Err(self.range_error("invalid position", position));
        }
        match position.checked_add(len) {
            Some(end) if end <= self.end => Ok(self.derive(position, end, None)),
            _ => Err(self.range_error("invalid limit", len)),
        }
    }

    /// Read the whole segment as (lossy UTF-8) text. Meant for small segments.
    pub fn read_string(&self) -> Result<String, Error> {
        let len = usize::try_from(self.len())
            .map_err(|_| self.range_error("segment too large to materialize", self.end))?;
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, self.begin)
            .map_err(|err| Error::io(err, "failed to read segment").with_path(self.path()))?;
        Ok(buf.to_str_lossy().into_owned())
    }

    /// Find the sub-segment covering up to `max_lines` lines.
    ///
    /// `None` means no limit. With `backward` the lines are counted from the
    /// end of this segment, otherwise from its beginning. With `lines_only`
    /// partial lines at the scan's far edge are excluded from the result.
    pub fn find_lines(
        &self,
        max_lines: Option<u32>,
        lines_only: bool,
        backward: bool,
    ) -> Result<Self, Error> {
        if max_lines.is_none() && !lines_only {
            return Ok(self.clone());
        }
        if backward {
            self.find_lines_backward(max_lines, lines_only)
        } else {
            self.find_lines_forward(max_lines, lines_only)
        }
    }

    fn find_lines_forward(&self, max_lines: Option<u32>, lines_only: bool) -> Result<Self, Error> {
        let mut reader = BlockReader::new(self);
        let mut count = 0u32;
        let mut end_pos = self.begin;
        let mut line_end = self.begin;
        while below_limit(count, max_lines) && end_pos < self.end {
            if reader.byte_at(end_pos, false)? == b'\n' {
                line_end = end_pos + 1;
                count = count_line(count);
            }
            end_pos += 1;
        }
        if lines_only {
            end_pos = line_end;
        }
        Ok(self.derive(self.begin, end_pos, Some(count)))
    }

    fn find_lines_backward(&self, max_lines: Option<u32>, lines_only: bool) -> Result<Self, Error> {
        let mut reader = BlockReader::new(self);
        let mut count = 0u32;
        let mut begin_pos = self.end;
        let mut end_pos = self.end;
        // With lines_only the first newline seen marks the result's end.
        let mut skip = lines_only;
        let mut last = 0u8;
        while below_limit(count, max_lines) && begin_pos > self.begin {
            begin_pos -= 1;
            last = reader.byte_at(begin_pos, true)?;
            if last == b'\n' {
                if skip {
                    end_pos = begin_pos + 1;
                    skip = false;
                } else if begin_pos < self.end - 1 {
                    count = count_line(count);
                }
            }
        }
        if skip {
            begin_pos = end_pos;
        } else if max_lines.is_some() && last == b'\n' && end_pos - begin_pos > 1 {
            begin_pos += 1;
        }
        Ok(self.derive(begin_pos, end_pos, Some(count)))
    }

    fn derive(&self, begin: u64, end: u64, lines: Option<u32>) -> Self {
        Self {
            file: Arc::clone(&self.file),
            path: Arc::clone(&self.path),
            begin,
            end,
            lines,
        }
    }

    fn range_error(&self, message: &str, offset: u64) -> Error {
        Error::new(ErrorKind::InvalidRange)
            .with_message(message)
            .with_path(self.path())
            .with_offset(offset)
    }
}

fn below_limit(count: u32, max_lines: Option<u32>) -> bool {
    max_lines.is_none_or(|max| count < max)
}

// Unlimited scans over huge logs pin the count at `u32::MAX`.
fn count_line(count: u32) -> u32 {
    count.saturating_add(1)
}

// Block-buffered byte access bounded to one segment.
struct BlockReader<'a> {
    segment: &'a FileSegment,
    block: Vec<u8>,
    block_start: u64,
}

impl<'a> BlockReader<'a> {
    fn new(segment: &'a FileSegment) -> Self {
        Self {
            segment,
            block: Vec::with_capacity(SCAN_BLOCK),
            block_start: 0,
        }
    }

    fn byte_at(&mut self, pos: u64, backward: bool) -> Result<u8, Error> {
        let loaded = pos >= self.block_start && pos < self.block_start + self.block.len() as u64;
        if !loaded {
            self.fill(pos, backward)?;
        }
        Ok(self.block[(pos - self.block_start) as usize])
    }

    fn fill(&mut self, pos: u64, backward: bool) -> Result<(), Error> {
        let block = SCAN_BLOCK as u64;
        let (start, stop) = if backward {
            (pos.saturating_sub(block - 1).max(self.segment.begin), pos + 1)
        } else {
            (pos, (pos + block).min(self.segment.end))
        };
        self.block.resize((stop - start) as usize, 0);
        read_exact_at(&self.segment.file, &mut self.block, start).map_err(|err| {
            Error::io(err, "failed to scan segment")
                .with_path(self.segment.path())
                .with_offset(start)
        })?;
        self.block_start = start;
        Ok(())
    }
}

pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match read_at(file, buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(read) => {
                buf = &mut buf[read..];
                offset += read as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}
