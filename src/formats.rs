//! Payload decoding shared by all connectors.
//!
//! | Format | Streaming | Notes |
//! |--------|-----------|-------|
//! | JSON Lines (`jsonl`, `ndjson`) | yes | blank lines are ignored |
//! | JSON (`json`) | no | top-level array, or object holding the list under `items_key` |
//! | CSV / TSV | yes | header row becomes the keys; values stay strings |
//!
//! Every record that is not a JSON object is reported as
//! [`ReadError::Malformed`] and skipped by the caller.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};

use crate::cache::url_extension;
use crate::error::ReadError;
use crate::models::Item;
use crate::traits::ItemIter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFormat {
    JsonLines,
    Json,
    Csv,
    Tsv,
}

impl ItemFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "ndjson" | "jsonlines" => Some(Self::JsonLines),
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "tsv" | "tab" => Some(Self::Tsv),
            _ => None,
        }
    }

    /// Format implied by a path or URL extension.
    pub fn from_location(location: &str) -> Option<Self> {
        url_extension(location).and_then(|ext| Self::from_name(&ext))
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let base = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match base.as_str() {
            "application/x-ndjson" | "application/jsonl" | "application/jsonlines"
            | "application/x-jsonlines" => Some(Self::JsonLines),
            "application/json" => Some(Self::Json),
            "text/csv" => Some(Self::Csv),
            "text/tab-separated-values" => Some(Self::Tsv),
            _ => None,
        }
    }

    /// Pick a format: explicit name, then location extension, then content type.
    pub fn resolve(
        explicit: Option<&str>,
        location: &str,
        content_type: Option<&str>,
    ) -> Result<Self> {
        if let Some(name) = explicit {
            return Self::from_name(name)
                .ok_or_else(|| anyhow::anyhow!("unsupported format '{}'", name));
        }
        Self::from_location(location)
            .or_else(|| content_type.and_then(Self::from_content_type))
            .ok_or_else(|| anyhow::anyhow!("cannot infer item format for '{}'", location))
    }
}

/// Decode items from `reader` lazily (except for JSON, which is parsed whole).
pub fn decode_items<'a, R>(reader: R, format: ItemFormat, items_key: Option<&str>) -> Result<ItemIter<'a>>
where
    R: Read + 'a,
{
    match format {
        ItemFormat::JsonLines => Ok(Box::new(JsonLinesIter::new(reader))),
        ItemFormat::Json => {
            let items = parse_json_document(reader, items_key)?;
            Ok(Box::new(items.into_iter()))
        }
        ItemFormat::Csv => decode_delimited(reader, b','),
        ItemFormat::Tsv => decode_delimited(reader, b'\t'),
    }
}

/// Count the records `decode_items` would yield, malformed ones included.
pub fn count_items<R: Read>(reader: R, format: ItemFormat, items_key: Option<&str>) -> Result<usize> {
    match format {
        ItemFormat::JsonLines => {
            let mut count = 0;
            for line in BufReader::new(reader).lines() {
                if !line?.trim().is_empty() {
                    count += 1;
                }
            }
            Ok(count)
        }
        ItemFormat::Json => Ok(parse_json_document(reader, items_key)?.len()),
        ItemFormat::Csv | ItemFormat::Tsv => {
            let delimiter = if format == ItemFormat::Csv { b',' } else { b'\t' };
            let mut csv_reader = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .flexible(true)
                .from_reader(reader);
            let mut count = 0;
            for record in csv_reader.records() {
                record?;
                count += 1;
            }
            Ok(count)
        }
    }
}

struct JsonLinesIter<R> {
    lines: std::io::Lines<BufReader<R>>,
    position: usize,
    failed: bool,
}

impl<R: Read> JsonLinesIter<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            position: 0,
            failed: false,
        }
    }
}

impl<R: Read> Iterator for JsonLinesIter<R> {
    type Item = Result<Item, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(ReadError::Source(
                        anyhow::Error::new(e).context("failed to read JSON lines payload"),
                    )));
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let position = self.position;
            self.position += 1;
            return Some(match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(ReadError::malformed(position, "line is not a JSON object")),
                Err(e) => Err(ReadError::malformed(position, e.to_string())),
            });
        }
    }
}

fn parse_json_document<R: Read>(
    reader: R,
    items_key: Option<&str>,
) -> Result<Vec<Result<Item, ReadError>>> {
    let document: Value =
        serde_json::from_reader(BufReader::new(reader)).context("failed to parse JSON payload")?;

    let list = match (document, items_key) {
        (Value::Object(mut map), Some(key)) => match map.remove(key) {
            Some(Value::Array(list)) => list,
            Some(_) => bail!("'{}' is not a list", key),
            None => bail!("JSON payload has no '{}' key", key),
        },
        (Value::Array(list), _) => list,
        (Value::Object(map), None) => vec![Value::Object(map)],
        _ => bail!("JSON payload must be an array or an object"),
    };

    Ok(list
        .into_iter()
        .enumerate()
        .map(|(position, value)| match value {
            Value::Object(map) => Ok(map),
            _ => Err(ReadError::malformed(position, "element is not a JSON object")),
        })
        .collect())
}

fn decode_delimited<'a, R: Read + 'a>(reader: R, delimiter: u8) -> Result<ItemIter<'a>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader
        .headers()
        .context("failed to read header row")?
        .clone();

    let iter = csv_reader
        .into_records()
        .enumerate()
        .map(move |(position, record)| match record {
            Ok(record) => Ok(headers
                .iter()
                .zip(record.iter())
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect()),
            Err(e) => Err(ReadError::malformed(position, e.to_string())),
        });
    Ok(Box::new(iter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(iter: ItemIter<'_>) -> (Vec<Item>, usize) {
        let mut items = Vec::new();
        let mut bad = 0;
        for r in iter {
            match r {
                Ok(item) => items.push(item),
                Err(_) => bad += 1,
            }
        }
        (items, bad)
    }

    #[test]
    fn json_lines_skip_blank_and_flag_bad_lines() {
        let data = "{\"id\": 1}\n\n not json\n[1,2]\n{\"id\": 2}\n";
        let (items, bad) = collect(decode_items(data.as_bytes(), ItemFormat::JsonLines, None).unwrap());
        assert_eq!(items.len(), 2);
        assert_eq!(bad, 2);
        assert_eq!(items[1]["id"], 2);
        assert_eq!(count_items(data.as_bytes(), ItemFormat::JsonLines, None).unwrap(), 4);
    }

    #[test]
    fn json_array_and_items_key() {
        let array = r#"[{"id": "a"}, {"id": "b"}, 3]"#;
        let (items, bad) = collect(decode_items(array.as_bytes(), ItemFormat::Json, None).unwrap());
        assert_eq!(items.len(), 2);
        assert_eq!(bad, 1);

        let wrapped = r#"{"meta": {}, "data": [{"id": 1}]}"#;
        let (items, _) =
            collect(decode_items(wrapped.as_bytes(), ItemFormat::Json, Some("data")).unwrap());
        assert_eq!(items.len(), 1);

        assert!(decode_items(wrapped.as_bytes(), ItemFormat::Json, Some("missing")).is_err());
    }

    #[test]
    fn single_object_is_one_item() {
        let (items, _) =
            collect(decode_items(r#"{"id": 1}"#.as_bytes(), ItemFormat::Json, None).unwrap());
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn csv_and_tsv_use_headers() {
        let csv_data = "id,text\n1,hello\n2,\"a, b\"\n";
        let (items, _) = collect(decode_items(csv_data.as_bytes(), ItemFormat::Csv, None).unwrap());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], "1");
        assert_eq!(items[1]["text"], "a, b");
        assert_eq!(count_items(csv_data.as_bytes(), ItemFormat::Csv, None).unwrap(), 2);

        let tsv_data = "id\ttext\nx\ty\n";
        let (items, _) = collect(decode_items(tsv_data.as_bytes(), ItemFormat::Tsv, None).unwrap());
        assert_eq!(items[0]["text"], "y");
    }

    #[test]
    fn format_resolution_order() {
        assert_eq!(
            ItemFormat::resolve(Some("csv"), "a.json", None).unwrap(),
            ItemFormat::Csv
        );
        assert_eq!(
            ItemFormat::resolve(None, "https://x/a.ndjson?x=1", None).unwrap(),
            ItemFormat::JsonLines
        );
        assert_eq!(
            ItemFormat::resolve(None, "https://x/export", Some("text/csv; charset=utf-8")).unwrap(),
            ItemFormat::Csv
        );
        assert!(ItemFormat::resolve(None, "https://x/export", None).is_err());
        assert!(ItemFormat::resolve(Some("parquet"), "a", None).is_err());
    }
}
