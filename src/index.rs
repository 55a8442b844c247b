//! Multistream index parsing and page lookup.
//!
//! An index file has one `byte_offset:page_id:page_title` line per page,
//! ordered by offset. Consecutive lines sharing an offset belong to the same
//! compressed stream. Index files are read as plain text, bzip2 or gzip,
//! detected from their first bytes.

use crate::error::DumpError;
use crate::types::{ShardId, StreamRecord};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::io::{BufRead, BufReader, Read};
use std::ops::Range;
use std::path::Path;

/// One independently decodable compressed stream and the pages it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub offset: u64,
    /// Start of the next stream, or the shard length for the last one.
    pub end_offset: u64,
    /// Page ids in index order.
    pub page_ids: Vec<u64>,
}

impl Stream {
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.end_offset
    }
}

/// Where a page lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocation {
    pub shard_id: ShardId,
    /// Position of the stream within [`StreamIndex::streams`].
    pub stream: usize,
    pub range: Range<u64>,
}

/// A compressed byte span to decode; `stream` is `None` for the unindexed
/// dump header that precedes the first indexed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub range: Range<u64>,
    pub stream: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct PageEntry {
    page_id: u64,
    stream: usize,
    record: usize,
}

/// Parsed index of one shard.
#[derive(Debug, Clone)]
pub struct StreamIndex {
    shard_id: ShardId,
    shard_len: u64,
    records: Vec<StreamRecord>,
    streams: Vec<Stream>,
    /// Sorted by page id for binary search.
    by_page: Vec<PageEntry>,
}

impl StreamIndex {
    /// Parses index lines for a shard whose compressed length is `shard_len`.
    pub fn parse<R: BufRead>(shard_id: ShardId, reader: R, shard_len: u64) -> Result<Self, DumpError> {
        let mut records: Vec<StreamRecord> = Vec::new();
        let mut streams: Vec<Stream> = Vec::new();
        let mut by_page = Vec::new();
        let mut line_no = 0;

        for line in reader.split(b'\n') {
            line_no += 1;
            let line = line?;
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            let record = parse_line(line, line_no)?;

            match streams.last_mut() {
                Some(last) if record.byte_offset == last.offset => {}
                Some(last) if record.byte_offset < last.offset => {
                    return Err(DumpError::IndexCorrupt {
                        line: line_no,
                        reason: format!(
                            "offset {} goes backwards (previous {})",
                            record.byte_offset, last.offset
                        ),
                    });
                }
                Some(last) => {
                    last.end_offset = record.byte_offset;
                    streams.push(Stream {
                        offset: record.byte_offset,
                        end_offset: shard_len,
                        page_ids: Vec::new(),
                    });
                }
                None => streams.push(Stream {
                    offset: record.byte_offset,
                    end_offset: shard_len,
                    page_ids: Vec::new(),
                }),
            }

            let stream = streams.len() - 1;
            streams[stream].page_ids.push(record.page_id);
            by_page.push(PageEntry {
                page_id: record.page_id,
                stream,
                record: records.len(),
            });
            records.push(record);
        }

        if let Some(last) = streams.last() {
            if last.offset >= shard_len {
                return Err(DumpError::IndexCorrupt {
                    line: line_no,
                    reason: format!(
                        "stream offset {} lies beyond the shard length {}",
                        last.offset, shard_len
                    ),
                });
            }
        }

        by_page.sort_by_key(|e| e.page_id);
        if let Some(pair) = by_page.windows(2).find(|w| w[0].page_id == w[1].page_id) {
            return Err(DumpError::IndexCorrupt {
                line: pair[1].record + 1,
                reason: format!("page {} is listed twice", pair[1].page_id),
            });
        }

        Ok(Self {
            shard_id,
            shard_len,
            records,
            streams,
            by_page,
        })
    }

    /// Parses an index file, decompressing it first if it is bzip2 or gzip.
    pub fn parse_file(shard_id: ShardId, path: &Path, shard_len: u64) -> Result<Self, DumpError> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::with_capacity(1024 * 1024, file);
        let magic = reader.fill_buf()?;

        if magic.starts_with(b"BZh") {
            let decoder = BufReader::new(MultiBzDecoder::new(reader));
            Self::parse(shard_id, decoder, shard_len)
        } else if magic.starts_with(&[0x1f, 0x8b]) {
            let decoder = BufReader::new(MultiGzDecoder::new(reader));
            Self::parse(shard_id, decoder, shard_len)
        } else {
            Self::parse(shard_id, reader, shard_len)
        }
    }

    /// Finds the stream holding `page_id`.
    ///
    /// A miss is [`DumpError::PageNotIndexed`]: pages deleted upstream leave
    /// gaps, so callers should treat it as an ordinary miss.
    pub fn lookup(&self, page_id: u64) -> Result<StreamLocation, DumpError> {
        let entry = self.entry(page_id).ok_or(DumpError::PageNotIndexed(page_id))?;
        Ok(StreamLocation {
            shard_id: self.shard_id.clone(),
            stream: entry.stream,
            range: self.streams[entry.stream].byte_range(),
        })
    }

    pub fn title(&self, page_id: u64) -> Option<&str> {
        self.entry(page_id)
            .map(|e| self.records[e.record].page_title.as_str())
    }

    pub fn contains(&self, page_id: u64) -> bool {
        self.entry(page_id).is_some()
    }

    fn entry(&self, page_id: u64) -> Option<PageEntry> {
        self.by_page
            .binary_search_by_key(&page_id, |e| e.page_id)
            .ok()
            .map(|i| self.by_page[i])
    }

    /// Index of the stream whose byte range contains `offset`.
    pub fn stream_containing(&self, offset: u64) -> Option<usize> {
        if offset >= self.shard_len {
            return None;
        }
        match self.streams.binary_search_by_key(&offset, |s| s.offset) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    /// Bytes before the first indexed stream (the dump header), if any.
    pub fn header_range(&self) -> Option<Range<u64>> {
        let end = self.streams.first().map(|s| s.offset).unwrap_or(self.shard_len);
        (end > 0).then_some(0..end)
    }

    /// Decodable spans overlapping `range`, in ascending offset order.
    ///
    /// A range starting mid-stream is widened down to that stream's start,
    /// since streams only decode from their boundaries.
    pub fn spans(&self, range: Range<u64>) -> Vec<Span> {
        let mut spans = Vec::new();
        if range.start >= range.end {
            return spans;
        }

        if let Some(header) = self.header_range() {
            if range.start < header.end {
                spans.push(Span {
                    range: header,
                    stream: None,
                });
            }
        }

        let first = match self.stream_containing(range.start) {
            Some(i) => i,
            None if range.start < self.shard_len => 0,
            None => return spans,
        };
        for (i, stream) in self.streams.iter().enumerate().skip(first) {
            if stream.offset >= range.end {
                break;
            }
            spans.push(Span {
                range: stream.byte_range(),
                stream: Some(i),
            });
        }
        spans
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn shard_len(&self) -> u64 {
        self.shard_len
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn records(&self) -> &[StreamRecord] {
        &self.records
    }

    pub fn page_count(&self) -> usize {
        self.records.len()
    }
}

fn parse_line(line: &str, line_no: usize) -> Result<StreamRecord, DumpError> {
    let corrupt = |reason: String| DumpError::IndexCorrupt {
        line: line_no,
        reason,
    };

    let mut parts = line.splitn(3, ':');
    let offset = parts.next().unwrap_or_default();
    let page_id = parts
        .next()
        .ok_or_else(|| corrupt(format!("expected offset:page_id:title, got {:?}", line)))?;
    // Titles may themselves contain ':'.
    let title = parts
        .next()
        .ok_or_else(|| corrupt(format!("missing title in {:?}", line)))?;

    Ok(StreamRecord {
        byte_offset: offset
            .parse()
            .map_err(|_| corrupt(format!("bad offset {:?}", offset)))?,
        page_id: page_id
            .parse()
            .map_err(|_| corrupt(format!("bad page id {:?}", page_id)))?,
        page_title: title.to_string(),
    })
}
