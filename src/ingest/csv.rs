//! Streaming CSV reader.
//!
//! Reads one record at a time from any async buffered reader, so an input of
//! any size is consumed with memory bounded by its longest record. Supports
//! quoted fields, doubled quotes, CRLF line endings and newlines inside
//! quoted fields.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::IngestError;

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("Invalid regex for header whitespace"))
}

/// Normalizes a column name: strips a byte-order mark, trims, collapses
/// whitespace runs to `_` and lowercases.
pub fn normalize_header(raw: &str) -> String {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    whitespace_pattern()
        .replace_all(trimmed, "_")
        .to_lowercase()
}

/// True if every field is empty or whitespace.
pub fn is_blank(record: &[String]) -> bool {
    record.iter().all(|field| field.trim().is_empty())
}

/// True if `record` repeats the (normalized) header row.
pub fn echoes_header(headers: &[String], record: &[String]) -> bool {
    headers.len() == record.len()
        && headers
            .iter()
            .zip(record)
            .all(|(header, value)| *header == normalize_header(value))
}

/// Maps a record onto the headers. Fields beyond the header row are keyed
/// `_{position}`; missing trailing fields are left out.
pub fn to_row(headers: &[String], record: Vec<String>) -> Map<String, Value> {
    let mut row = Map::with_capacity(record.len());
    for (i, value) in record.into_iter().enumerate() {
        let key = headers
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("_{}", i));
        row.insert(key, Value::String(value));
    }
    row
}

/// Record-at-a-time CSV reader.
pub struct CsvReader<R> {
    reader: R,
    buf: String,
    line: u64,
}

impl<R: AsyncBufRead + Unpin> CsvReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
            line: 0,
        }
    }

    /// Physical lines consumed so far.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Reads the header row and normalizes it. Returns `None` for an empty input.
    pub async fn read_headers(&mut self) -> Result<Option<Vec<String>>, IngestError> {
        Ok(self
            .next_record()
            .await?
            .map(|record| record.iter().map(|h| normalize_header(h)).collect()))
    }

    /// Reads the next record, or `None` at end of input.
    pub async fn next_record(&mut self) -> Result<Option<Vec<String>>, IngestError> {
        let start_line = self.line + 1;
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut in_quotes = false;
        let mut quoted = false;
        let mut started = false;

        loop {
            self.buf.clear();
            let read = self.reader.read_line(&mut self.buf).await?;
            if read == 0 {
                if in_quotes {
                    return Err(IngestError::Malformed {
                        line: start_line,
                        message: "unterminated quoted field".to_string(),
                    });
                }
                if !started {
                    return Ok(None);
                }
                if !quoted && field.ends_with('\r') {
                    field.pop();
                }
                fields.push(field);
                return Ok(Some(fields));
            }
            self.line += 1;
            started = true;

            let mut chars = self.buf.chars().peekable();
            while let Some(c) = chars.next() {
                if in_quotes {
                    if c == '"' {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            field.push('"');
                        } else {
                            in_quotes = false;
                        }
                    } else {
                        field.push(c);
                    }
                    continue;
                }
                match c {
                    '"' if field.is_empty() && !quoted => {
                        in_quotes = true;
                        quoted = true;
                    }
                    ',' => {
                        fields.push(std::mem::take(&mut field));
                        quoted = false;
                    }
                    '\r' if chars.peek() == Some(&'\n') => {}
                    '\n' => {
                        fields.push(std::mem::take(&mut field));
                        return Ok(Some(fields));
                    }
                    _ => field.push(c),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(input: &str) -> Result<Vec<Vec<String>>, IngestError> {
        let mut reader = CsvReader::new(input.as_bytes());
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().await? {
            records.push(record);
        }
        Ok(records)
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("\u{feff}  First   Name "), "first_name");
        assert_eq!(normalize_header("E-mail\tAddress"), "e-mail_address");
        assert_eq!(normalize_header("ID"), "id");
    }

    #[tokio::test]
    async fn test_simple_records() {
        let records = read_all("a,b\n1,2\n3,4").await.unwrap();
        assert_eq!(
            records,
            vec![vec!["a", "b"], vec!["1", "2"], vec!["3", "4"]]
        );
    }

    #[tokio::test]
    async fn test_quotes_and_crlf() {
        let records = read_all("name,note\r\n\"Smith, J\",\"said \"\"hi\"\"\"\r\n")
            .await
            .unwrap();
        assert_eq!(records[0], vec!["name", "note"]);
        assert_eq!(records[1], vec!["Smith, J", "said \"hi\""]);
    }

    #[tokio::test]
    async fn test_newline_inside_quotes() {
        let mut reader = CsvReader::new("a,b\n\"line one\nline two\",x\nlast,y\n".as_bytes());
        reader.read_headers().await.unwrap();
        let record = reader.next_record().await.unwrap().unwrap();
        assert_eq!(record, vec!["line one\nline two", "x"]);
        assert_eq!(reader.line(), 3);
        let record = reader.next_record().await.unwrap().unwrap();
        assert_eq!(record, vec!["last", "y"]);
        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unterminated_quote_is_malformed() {
        let err = read_all("a,b\n1,\"open\n2,3\n").await.unwrap_err();
        match err {
            IngestError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut reader = CsvReader::new("".as_bytes());
        assert!(reader.read_headers().await.unwrap().is_none());
    }

    #[test]
    fn test_blank_and_header_echo() {
        let headers = vec!["first_name".to_string(), "age".to_string()];
        assert!(is_blank(&["".to_string(), "  ".to_string()]));
        assert!(!is_blank(&["".to_string(), "1".to_string()]));
        assert!(echoes_header(
            &headers,
            &["First Name".to_string(), "AGE".to_string()]
        ));
        assert!(!echoes_header(
            &headers,
            &["Ada".to_string(), "36".to_string()]
        ));
    }

    #[test]
    fn test_to_row_extra_columns() {
        let headers = vec!["a".to_string()];
        let row = to_row(&headers, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(row.get("a"), Some(&Value::String("1".into())));
        assert_eq!(row.get("_1"), Some(&Value::String("2".into())));
        let keys: Vec<_> = row.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "_1"]);
    }
}
