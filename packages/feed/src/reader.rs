//! Delimited feed reader.
//!
//! Loads a feed from a local path or an `http(s)` URL, optionally
//! gunzips it, and parses it with the first row as headers. Every data row
//! becomes a [`RawRecord`] mapping trimmed header -> trimmed cell value.

use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::PathBuf;

use crate::{FeedError, RawRecord, retry};

/// Where a feed lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLocation {
    /// A file on local disk.
    Path(PathBuf),
    /// A remote file fetched over HTTP(S).
    Url(String),
}

impl FeedLocation {
    /// Interprets `s` as a URL when it starts with `http://` or `https://`,
    /// otherwise as a filesystem path.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            Self::Url(s.to_string())
        } else {
            Self::Path(PathBuf::from(s))
        }
    }

    fn looks_gzipped(&self) -> bool {
        let name = match self {
            Self::Path(path) => path.to_string_lossy().to_lowercase(),
            Self::Url(url) => url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_lowercase(),
        };
        name.ends_with(".gz")
    }
}

impl std::fmt::Display for FeedLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
        }
    }
}

/// Reader for a single delimited feed file.
#[derive(Debug, Clone)]
pub struct FeedReader {
    location: FeedLocation,
    headers: BTreeMap<String, String>,
    is_gzipped: bool,
    delimiter: u8,
    max_records: Option<u64>,
}

impl FeedReader {
    /// Creates a comma-delimited reader. Gzip is assumed when the location
    /// ends in `.gz`.
    #[must_use]
    pub fn new(location: FeedLocation) -> Self {
        let is_gzipped = location.looks_gzipped();
        Self {
            location,
            headers: BTreeMap::new(),
            is_gzipped,
            delimiter: b',',
            max_records: None,
        }
    }

    /// Overrides gzip detection.
    #[must_use]
    pub const fn with_gzip(mut self, gzipped: bool) -> Self {
        self.is_gzipped = gzipped;
        self
    }

    /// Sets the field delimiter byte.
    #[must_use]
    pub const fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Caps the number of records parsed.
    #[must_use]
    pub const fn with_max_records(mut self, max: u64) -> Self {
        self.max_records = Some(max);
        self
    }

    /// Adds an HTTP header sent with remote downloads, e.g. the API token
    /// some ad networks require.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Returns the feed location.
    #[must_use]
    pub const fn location(&self) -> &FeedLocation {
        &self.location
    }

    /// Loads and parses the whole feed.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if the feed cannot be fetched, decompressed, or
    /// parsed.
    pub async fn read(&self) -> Result<Vec<RawRecord>, FeedError> {
        let bytes = match &self.location {
            FeedLocation::Path(path) => tokio::fs::read(path).await?,
            FeedLocation::Url(url) => {
                let client = self.build_client()?;
                retry::send_bytes(|| client.get(url)).await?
            }
        };

        log::debug!("Loaded {} bytes from {}", bytes.len(), self.location);

        let bytes = if self.is_gzipped {
            let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            log::debug!("Decompressed to {} bytes", decompressed.len());
            decompressed
        } else {
            bytes
        };

        let records = parse_delimited(&bytes, self.delimiter, self.max_records)?;
        log::info!("Parsed {} records from {}", records.len(), self.location);
        Ok(records)
    }

    fn build_client(&self) -> Result<reqwest::Client, FeedError> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| FeedError::InvalidHeader(format!("name '{key}': {e}")))?;
            let val = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| FeedError::InvalidHeader(format!("value for '{key}': {e}")))?;
            header_map.insert(name, val);
        }
        reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(FeedError::Http)
    }
}

/// Parses delimited text with a header row into records.
///
/// Short rows are padded with empty strings; extra cells beyond the header
/// count are ignored.
///
/// # Errors
///
/// Returns [`FeedError::MissingHeader`] if the first row is empty, or
/// [`FeedError::Csv`] on malformed input.
pub fn parse_delimited(
    bytes: &[u8],
    delimiter: u8,
    max_records: Option<u64>,
) -> Result<Vec<RawRecord>, FeedError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_owned())
        .collect();

    if headers.iter().all(String::is_empty) {
        return Err(FeedError::MissingHeader);
    }

    let mut records = Vec::new();

    for row in reader.records() {
        let row = row?;

        let mut record = RawRecord::new();
        for (i, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let value = row.get(i).unwrap_or("").trim().to_owned();
            record.insert(header.clone(), serde_json::Value::String(value));
        }
        records.push(record);

        if let Some(max) = max_records
            && records.len() as u64 >= max
        {
            log::info!("Reached max_records limit ({max}), stopping feed parse");
            break;
        }
    }

    Ok(records)
}

/// Splits a `KEY=VALUE` header argument.
///
/// # Errors
///
/// Returns [`FeedError::InvalidHeader`] if there is no `=` or the key is
/// blank.
pub fn parse_header(s: &str) -> Result<(String, String), FeedError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(FeedError::InvalidHeader(format!("expected KEY=VALUE, got {s:?}"))),
    }
}

/// Parses a user-supplied delimiter (`","`, `"|"`, `"\t"`, `"tab"`, ...).
///
/// # Errors
///
/// Returns [`FeedError::UnsupportedDelimiter`] unless the input names a
/// single-byte delimiter.
pub fn parse_delimiter(s: &str) -> Result<u8, FeedError> {
    match s {
        "\\t" | "\t" | "tab" | "TAB" => Ok(b'\t'),
        _ if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        _ => Err(FeedError::UnsupportedDelimiter(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn parses_header_keyed_records() {
        let csv = "Title, Price ,SKU\nShoe,$19.99,S1\n Sock ,2.50,S2\n";
        let records = parse_delimited(csv.as_bytes(), b',', None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Title"], "Shoe");
        assert_eq!(records[0]["Price"], "$19.99");
        assert_eq!(records[1]["Title"], "Sock");
    }

    #[test]
    fn pads_short_rows() {
        let csv = "a|b|c\n1|2\n";
        let records = parse_delimited(csv.as_bytes(), b'|', None).unwrap();
        assert_eq!(records[0]["c"], "");
    }

    #[test]
    fn respects_max_records() {
        let csv = "a\n1\n2\n3\n";
        let records = parse_delimited(csv.as_bytes(), b',', Some(2)).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn strips_byte_order_mark() {
        let csv = "\u{feff}name,sku\nShoe,S1\n";
        let records = parse_delimited(csv.as_bytes(), b',', None).unwrap();
        assert_eq!(records[0]["name"], "Shoe");
    }

    #[test]
    fn rejects_empty_header() {
        let err = parse_delimited(b"\n", b',', None).unwrap_err();
        assert!(matches!(err, FeedError::MissingHeader | FeedError::Csv(_)));
    }

    #[test]
    fn parses_delimiter_names() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter("|").unwrap(), b'|');
        assert!(parse_delimiter("::").is_err());
    }

    #[test]
    fn parses_header_arguments() {
        assert_eq!(
            parse_header("Authorization = Bearer abc=").unwrap(),
            ("Authorization".to_string(), "Bearer abc=".to_string())
        );
        assert!(matches!(parse_header("no-value"), Err(FeedError::InvalidHeader(_))));
        assert!(matches!(parse_header(" =x"), Err(FeedError::InvalidHeader(_))));
    }

    #[test]
    fn valid_headers_build_a_client() {
        let reader = FeedReader::new(FeedLocation::parse("https://feeds.example.com/p.csv"))
            .with_header("X-Api-Key", "secret");
        assert!(reader.build_client().is_ok());
    }

    #[tokio::test]
    async fn invalid_header_fails_before_download() {
        let reader = FeedReader::new(FeedLocation::parse("https://feeds.example.com/p.csv"))
            .with_header("bad header", "secret");
        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, FeedError::InvalidHeader(ref m) if m.contains("bad header")));
    }

    #[test]
    fn detects_gzip_from_location() {
        assert!(FeedLocation::parse("https://cdn.example.com/feed.csv.gz?token=1").looks_gzipped());
        assert!(!FeedLocation::parse("/tmp/feed.csv").looks_gzipped());
    }

    #[tokio::test]
    async fn reads_gzipped_file() {
        let path = std::env::temp_dir().join("elementa_feed_reader_test.csv.gz");
        let file = std::fs::File::create(&path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(b"name\tsku\nShoe\tS1\n").unwrap();
        encoder.finish().unwrap();

        let reader = FeedReader::new(FeedLocation::Path(path.clone())).with_delimiter(b'\t');
        let records = reader.read().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["sku"], "S1");

        let _ = std::fs::remove_file(&path);
    }
}
