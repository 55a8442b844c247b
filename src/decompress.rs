//! Stream-level decompression of multistream shards.
//!
//! A shard is a concatenation of independent bzip2 streams, so any indexed
//! stream can be decoded by seeking to its offset and reading up to the next
//! one. Failures are scoped to the stream that produced them.

use crate::error::DumpError;
use crate::index::{Span, Stream, StreamIndex};
use crate::types::PageBlob;
use bzip2::read::MultiBzDecoder;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

const PAGE_OPEN: &[u8] = b"<page>";
const PAGE_CLOSE: &[u8] = b"</page>";

/// Decoded content of one compressed span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStream {
    pub offset: u64,
    /// Position in [`StreamIndex::streams`]; `None` for the dump header or
    /// when read back from the recompression cache.
    pub stream: Option<usize>,
    pub bytes: Vec<u8>,
}

/// Reads and decodes one compressed span of an open shard.
pub fn decode_span(file: &mut File, range: Range<u64>) -> Result<Vec<u8>, DumpError> {
    let decode_error = |reason: String| DumpError::DecodeError {
        offset: range.start,
        reason,
    };

    file.seek(SeekFrom::Start(range.start))?;
    let mut compressed = Vec::with_capacity((range.end - range.start) as usize);
    file.take(range.end - range.start)
        .read_to_end(&mut compressed)?;
    if (compressed.len() as u64) < range.end - range.start {
        return Err(decode_error(format!(
            "shard truncated: wanted {} bytes, found {}",
            range.end - range.start,
            compressed.len()
        )));
    }

    let mut decoded = Vec::with_capacity(compressed.len() * 4);
    MultiBzDecoder::new(compressed.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|e| decode_error(e.to_string()))?;
    Ok(decoded)
}

/// Lazily decodes the spans overlapping a byte range, in ascending offset order.
pub struct RangeDecoder {
    file: File,
    spans: std::vec::IntoIter<Span>,
}

impl Iterator for RangeDecoder {
    type Item = Result<DecodedStream, DumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.spans.next()?;
        Some(
            decode_span(&mut self.file, span.range.clone()).map(|bytes| DecodedStream {
                offset: span.range.start,
                stream: span.stream,
                bytes,
            }),
        )
    }
}

/// Decodes exactly the streams overlapping `range`.
///
/// A range starting mid-stream is rounded down to the containing stream's
/// start. Only the overlapping streams are read from disk.
pub fn decompress_range(
    shard_path: &Path,
    index: &StreamIndex,
    range: Range<u64>,
) -> Result<RangeDecoder, DumpError> {
    Ok(RangeDecoder {
        file: File::open(shard_path)?,
        spans: index.spans(range).into_iter(),
    })
}

/// Decodes one indexed stream.
pub fn decompress_stream(
    shard_path: &Path,
    index: &StreamIndex,
    stream: usize,
) -> Result<Vec<u8>, DumpError> {
    let range = index
        .streams()
        .get(stream)
        .map(Stream::byte_range)
        .ok_or_else(|| DumpError::DecodeError {
            offset: 0,
            reason: format!("no stream #{} in shard {}", stream, index.shard_id()),
        })?;
    let mut file = File::open(shard_path)?;
    decode_span(&mut file, range)
}

/// Reader over the whole shard decoded front to back, header and footer included.
pub fn decompress_file(shard_path: &Path) -> Result<impl Read, DumpError> {
    let file = File::open(shard_path)?;
    Ok(MultiBzDecoder::new(BufReader::with_capacity(
        4 * 1024 * 1024,
        file,
    )))
}

/// Lazily yields every page of a shard, stream by stream.
///
/// A stream that fails to decode yields one error and iteration moves on to
/// the next stream.
pub struct PageBlobs<'a> {
    file: File,
    index: &'a StreamIndex,
    next_stream: usize,
    pending: std::vec::IntoIter<PageBlob>,
}

impl Iterator for PageBlobs<'_> {
    type Item = Result<PageBlob, DumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(page) = self.pending.next() {
                return Some(Ok(page));
            }
            let stream = self.index.streams().get(self.next_stream)?;
            self.next_stream += 1;
            match decode_span(&mut self.file, stream.byte_range()) {
                Ok(bytes) => self.pending = page_blobs(stream, &bytes).into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Decodes every indexed stream of a shard into pages.
pub fn decompress_whole<'a>(
    shard_path: &Path,
    index: &'a StreamIndex,
) -> Result<PageBlobs<'a>, DumpError> {
    Ok(PageBlobs {
        file: File::open(shard_path)?,
        index,
        next_stream: 0,
        pending: Vec::new().into_iter(),
    })
}

/// Splits decoded stream content into `<page>…</page>` slices.
pub fn split_pages(bytes: &[u8]) -> Vec<&[u8]> {
    let mut pages = Vec::new();
    let mut cursor = 0;
    while let Some(start) = find(bytes, PAGE_OPEN, cursor) {
        let end = match find(bytes, PAGE_CLOSE, start) {
            Some(close) => close + PAGE_CLOSE.len(),
            None => break,
        };
        pages.push(&bytes[start..end]);
        cursor = end;
    }
    pages
}

/// Pairs the pages of a decoded stream with their ids.
///
/// Each page's id is read from its first `<id>` element; pages without one
/// take the id at the same position in the index.
pub fn page_blobs(stream: &Stream, bytes: &[u8]) -> Vec<PageBlob> {
    split_pages(bytes)
        .into_iter()
        .enumerate()
        .filter_map(|(i, page)| {
            let page_id = page_id_of(page).or_else(|| stream.page_ids.get(i).copied())?;
            Some(PageBlob {
                page_id,
                bytes: page.to_vec(),
            })
        })
        .collect()
}

fn page_id_of(page: &[u8]) -> Option<u64> {
    let start = find(page, b"<id>", 0)? + 4;
    let end = find(page, b"</id>", start)?;
    std::str::from_utf8(&page[start..end]).ok()?.trim().parse().ok()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{sample_pages, BuiltShard, MultistreamBuilder};
    use crate::types::ShardId;
    use std::io::Write;

    fn write_shard(shard: &BuiltShard) -> (tempfile::NamedTempFile, StreamIndex) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&shard.data).unwrap();
        file.flush().unwrap();
        let index = StreamIndex::parse(
            ShardId::new("1"),
            shard.index.as_bytes(),
            shard.data.len() as u64,
        )
        .unwrap();
        (file, index)
    }

    fn shard(first: u64, last: u64, per_stream: usize) -> BuiltShard {
        MultistreamBuilder::new("Test")
            .unwrap()
            .pages(&sample_pages(first, last), per_stream)
            .unwrap()
            .finish()
            .unwrap()
    }

    #[test]
    fn test_stream_concatenation_equals_whole_decode() {
        let built = shard(1, 25, 4);
        let (file, index) = write_shard(&built);

        let mut whole = Vec::new();
        decompress_file(file.path())
            .unwrap()
            .read_to_end(&mut whole)
            .unwrap();
        assert_eq!(whole, built.decoded);

        let mut joined = Vec::new();
        for stream in decompress_range(file.path(), &index, 0..index.shard_len()).unwrap() {
            joined.extend_from_slice(&stream.unwrap().bytes);
        }
        assert_eq!(joined, whole);
    }

    #[test]
    fn test_single_stream_request_reads_only_that_stream() {
        let built = shard(1, 12, 3);
        let (file, index) = write_shard(&built);

        let loc = index.lookup(8).unwrap();
        let mid = loc.range.start + 5;
        let decoded: Vec<_> = decompress_range(file.path(), &index, mid..mid + 1)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].offset, loc.range.start);

        let ids: Vec<u64> = page_blobs(&index.streams()[loc.stream], &decoded[0].bytes)
            .iter()
            .map(|p| p.page_id)
            .collect();
        assert_eq!(ids, vec![7, 8, 9]);
    }

    #[test]
    fn test_whole_shard_pages_in_order() {
        let built = shard(1, 10, 3);
        let (file, index) = write_shard(&built);

        let pages: Vec<PageBlob> = decompress_whole(file.path(), &index)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let ids: Vec<u64> = pages.iter().map(|p| p.page_id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
        assert!(pages[0].bytes.starts_with(b"<page>"));
        assert!(pages[0].bytes.ends_with(b"</page>"));
    }

    #[test]
    fn test_corrupt_stream_does_not_abort_siblings() {
        let built = shard(1, 9, 3);
        let mut data = built.data.clone();
        let index = StreamIndex::parse(ShardId::new("1"), built.index.as_bytes(), data.len() as u64)
            .unwrap();
        let victim = index.streams()[1].byte_range();
        for b in &mut data[victim.start as usize + 10..victim.start as usize + 40] {
            *b ^= 0x5a;
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let results: Vec<_> = decompress_whole(file.path(), &index).unwrap().collect();
        let ok: Vec<u64> = results
            .iter()
            .filter_map(|r| r.as_ref().ok().map(|p| p.page_id))
            .collect();
        assert_eq!(ok, vec![1, 2, 3, 7, 8, 9]);
        let errors: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            DumpError::DecodeError { offset, .. } if *offset == victim.start
        ));
    }

    #[test]
    fn test_split_pages_ignores_surrounding_markup() {
        let text = b"<siteinfo/>\n<page><id>3</id></page>\n  <page><id>4</id></page></mediawiki>";
        let pages = split_pages(text);
        assert_eq!(pages.len(), 2);
        assert_eq!(page_id_of(pages[1]), Some(4));
    }
}
