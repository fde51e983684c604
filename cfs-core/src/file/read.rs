use super::{CFile, CachedChunk, HandleState, not_readable};
use crate::locator::{ByteRange, ChunkSegment, resolve_range};
use crate::types::ChunkDescriptor;
use crate::{CfsError, Result};
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

fn chunk_read_error(segment: ChunkSegment, chunk: &ChunkDescriptor, error: CfsError) -> CfsError {
    CfsError::ChunkRead {
        index: segment.index,
        chunk_id: chunk.chunk_id,
        offset: segment.offset,
        source: Box::new(error),
    }
}

async fn drain<W>(sink: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    sink.write_all(bytes).await?;
    sink.flush().await
}

impl CFile {
    /// Copy `[offset, offset + length)` of the file into `sink`.
    ///
    /// `(0, 0)` means the whole file and a zero `length` means "to the end";
    /// ranges are clamped to the file size. Every chunk of the range is
    /// fetched concurrently, but bytes reach the sink in file order.
    pub async fn read_to<W>(&mut self, sink: &mut W, offset: u64, length: u64) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let HandleState::Read(state) = &mut self.state else {
            return Err(not_readable(&self.path));
        };

        let range = resolve_range(state.size, offset, length);
        state.cursor = range.offset;
        let Some(span) = state.locate(range)? else {
            return Ok(0);
        };

        tracing::debug!(
            "Reading {} bytes of {} at {} from chunks #{}..=#{}",
            range.length,
            self.path,
            range.offset,
            span.begin,
            span.end
        );

        let mut tasks = span
            .segments
            .into_iter()
            .map(|segment| {
                let reader = state.reader.clone();
                let chunk = state.chunks[segment.index].clone();
                let task = tokio::spawn(async move {
                    reader
                        .read_range(&chunk, segment.offset, segment.len)
                        .await
                        .map_err(|error| chunk_read_error(segment, &chunk, error))
                });
                (segment, task)
            })
            .collect::<Vec<_>>()
            .into_iter();

        let mut moved = 0;
        while let Some((segment, task)) = tasks.next() {
            let result = match task.await {
                Ok(result) => result,
                Err(error) => Err(chunk_read_error(
                    segment,
                    &state.chunks[segment.index],
                    error.into(),
                )),
            };

            let bytes = match result {
                Ok(bytes) => bytes,
                Err(error) => {
                    for (_, rest) in tasks {
                        rest.abort();
                    }
                    return Err(error);
                }
            };

            if let Err(error) = drain(&mut *sink, &bytes).await {
                for (_, rest) in tasks {
                    rest.abort();
                }
                return Err(error.into());
            }
            moved += bytes.len() as u64;
            state.cursor += bytes.len() as u64;
        }

        Ok(moved)
    }

    /// Like [`CFile::read_to`] with a newly created local file as the sink.
    pub async fn read_to_file(
        &mut self,
        destination: impl AsRef<Path>,
        offset: u64,
        length: u64,
    ) -> Result<u64> {
        if !self.is_read_only() {
            return Err(not_readable(&self.path));
        }

        let file = tokio::fs::File::create(destination.as_ref()).await?;
        let mut writer = BufWriter::new(file);
        self.read_to(&mut writer, offset, length).await
    }

    /// Fill `buf` from `offset`, fetching whole chunks and keeping the last
    /// one around so small sequential reads hit the data nodes once per
    /// chunk.
    pub async fn read_cached(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let HandleState::Read(state) = &mut self.state else {
            return Err(not_readable(&self.path));
        };

        if buf.is_empty() {
            return Ok(0);
        }

        let range = resolve_range(state.size, offset, buf.len() as u64);
        let Some(span) = state.locate(range)? else {
            state.cursor = range.offset;
            return Ok(0);
        };

        let mut filled = 0;
        for segment in span.segments {
            let chunk = &state.chunks[segment.index];
            let data = match &state.cached {
                Some(cached) if cached.index == segment.index => cached.data.clone(),
                _ => {
                    let data = state
                        .reader
                        .read_range(chunk, 0, chunk.chunk_size)
                        .await
                        .map_err(|error| chunk_read_error(segment, chunk, error))?;
                    state.cached = Some(CachedChunk {
                        index: segment.index,
                        data: data.clone(),
                    });
                    data
                }
            };

            let start = segment.offset as usize;
            let len = segment.len as usize;
            buf[filled..filled + len].copy_from_slice(&data[start..start + len]);
            filled += len;

            if segment.offset + segment.len == chunk.chunk_size {
                state.cached = None;
            }
        }

        state.cursor = range.offset + filled as u64;
        Ok(filled)
    }

    /// Read from the cursor into `buf`. Returns `0` at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let HandleState::Read(state) = &self.state else {
            return Err(not_readable(&self.path));
        };
        let cursor = state.cursor;
        self.pread(buf, cursor).await
    }

    /// Read into `buf` at `offset`, which has to be where the previous read
    /// stopped.
    pub async fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let HandleState::Read(state) = &mut self.state else {
            return Err(not_readable(&self.path));
        };

        if offset != state.cursor {
            return Err(CfsError::InvalidRequest(format!(
                "pread of {} at {} does not continue the last read at {}",
                self.path, offset, state.cursor
            )));
        }

        let length = (buf.len() as u64).min(state.size.saturating_sub(offset));
        let Some(span) = state.locate(ByteRange { offset, length })? else {
            return Ok(0);
        };

        let mut filled = 0;
        for segment in span.segments {
            let chunk = &state.chunks[segment.index];
            let bytes = state
                .reader
                .read_once(chunk, segment.offset, segment.len)
                .await
                .map_err(|error| chunk_read_error(segment, chunk, error))?;
            buf[filled..filled + bytes.len()].copy_from_slice(&bytes);
            filled += bytes.len();
        }

        state.cursor += filled as u64;
        Ok(filled)
    }

    /// Move the read cursor. Positions past the end are allowed and read as
    /// end of file.
    pub fn seek(&mut self, position: SeekFrom) -> Result<u64> {
        let HandleState::Read(state) = &mut self.state else {
            return Err(not_readable(&self.path));
        };

        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => state.cursor.checked_add_signed(delta),
            SeekFrom::End(delta) => state.size.checked_add_signed(delta),
        };

        let target = target.ok_or_else(|| {
            CfsError::InvalidRequest(format!("seek of {} to {:?} is out of range", self.path, position))
        })?;
        state.cursor = target;
        Ok(target)
    }
}
