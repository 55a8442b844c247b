//! Writer for multistream shards in the provider's format.
//!
//! Produces a bzip2 multistream data file (header stream, one stream per page
//! group, footer stream) together with its `offset:page_id:title` index.
//! Useful for building small local corpora and test fixtures.

use std::io::Write;

/// A page to be written: id, title and wikitext body.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub id: u64,
    pub title: String,
    pub text: String,
}

impl SourcePage {
    pub fn new(id: u64, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            text: text.into(),
        }
    }

    /// The `<page>` element as it appears in the decoded dump.
    pub fn to_xml(&self) -> String {
        format!(
            "  <page>\n    <title>{}</title>\n    <ns>0</ns>\n    <id>{}</id>\n    <revision>\n      <id>{}</id>\n      <text>{}</text>\n    </revision>\n  </page>\n",
            self.title,
            self.id,
            self.id * 10,
            self.text
        )
    }
}

/// A finished shard.
#[derive(Debug, Clone)]
pub struct BuiltShard {
    /// Compressed multistream bytes.
    pub data: Vec<u8>,
    /// Index text, one line per page.
    pub index: String,
    /// Everything the data decodes to, for comparison.
    pub decoded: Vec<u8>,
}

/// Builds a multistream shard one page group at a time.
pub struct MultistreamBuilder {
    data: Vec<u8>,
    index: String,
    decoded: Vec<u8>,
    level: bzip2::Compression,
}

impl MultistreamBuilder {
    pub fn new(site_name: &str) -> std::io::Result<Self> {
        let mut builder = Self {
            data: Vec::new(),
            index: String::new(),
            decoded: Vec::new(),
            level: bzip2::Compression::fast(),
        };
        let header = format!(
            "<mediawiki xml:lang=\"en\">\n  <siteinfo>\n    <sitename>{}</sitename>\n  </siteinfo>\n",
            site_name
        );
        builder.push_stream(header.as_bytes())?;
        Ok(builder)
    }

    /// Appends one compressed stream holding `pages`.
    pub fn stream(mut self, pages: &[SourcePage]) -> std::io::Result<Self> {
        let offset = self.data.len();
        for page in pages {
            self.index
                .push_str(&format!("{}:{}:{}\n", offset, page.id, page.title));
        }
        let body: String = pages.iter().map(SourcePage::to_xml).collect();
        self.push_stream(body.as_bytes())?;
        Ok(self)
    }

    /// Groups `pages` into streams of `per_stream` pages each.
    pub fn pages(mut self, pages: &[SourcePage], per_stream: usize) -> std::io::Result<Self> {
        for group in pages.chunks(per_stream.max(1)) {
            self = self.stream(group)?;
        }
        Ok(self)
    }

    pub fn finish(mut self) -> std::io::Result<BuiltShard> {
        self.push_stream(b"</mediawiki>\n")?;
        Ok(BuiltShard {
            data: self.data,
            index: self.index,
            decoded: self.decoded,
        })
    }

    fn push_stream(&mut self, content: &[u8]) -> std::io::Result<()> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), self.level);
        encoder.write_all(content)?;
        self.data.extend_from_slice(&encoder.finish()?);
        self.decoded.extend_from_slice(content);
        Ok(())
    }
}

/// Pages `first..=last` with generated titles and bodies.
pub fn sample_pages(first: u64, last: u64) -> Vec<SourcePage> {
    (first..=last)
        .map(|id| SourcePage::new(id, format!("Page {}", id), format!("Body of page {}.", id)))
        .collect()
}
