//! CSV record rows: `timestamp_iso,unix_ms,image_path,point_id,x,y,R,G,B`.

use crate::sampler::Rgb;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::path::Path;

pub const HEADER: [&str; 9] = [
    "timestamp_iso",
    "unix_ms",
    "image_path",
    "point_id",
    "x",
    "y",
    "R",
    "G",
    "B",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRow {
    pub timestamp_iso: String,
    pub unix_ms: i64,
    pub image_path: String,
    pub point_id: String,
    pub x: i64,
    pub y: i64,
    pub rgb: Option<Rgb>,
}

impl SampleRow {
    pub fn fields(&self) -> [String; 9] {
        let (r, g, b) = match self.rgb {
            Some(c) => (c.r.to_string(), c.g.to_string(), c.b.to_string()),
            None => (String::new(), String::new(), String::new()),
        };
        [
            self.timestamp_iso.clone(),
            self.unix_ms.to_string(),
            self.image_path.clone(),
            self.point_id.clone(),
            self.x.to_string(),
            self.y.to_string(),
            r,
            g,
            b,
        ]
    }

    pub fn from_fields(fields: &[String]) -> Result<Self> {
        if fields.len() != HEADER.len() {
            return Err(anyhow!("expected {} fields, got {}", HEADER.len(), fields.len()));
        }
        let int = |i: usize| -> Result<i64> {
            fields[i]
                .parse::<i64>()
                .with_context(|| format!("field {} is not an integer: {:?}", HEADER[i], fields[i]))
        };
        let channel = |i: usize| -> Result<u8> {
            fields[i].parse::<u8>().with_context(|| {
                format!("field {} is not a channel value: {:?}", HEADER[i], fields[i])
            })
        };
        let empty = fields[6..9].iter().filter(|f| f.is_empty()).count();
        let rgb = match empty {
            3 => None,
            0 => Some(Rgb { r: channel(6)?, g: channel(7)?, b: channel(8)? }),
            _ => return Err(anyhow!("partially empty color fields")),
        };
        Ok(SampleRow {
            timestamp_iso: fields[0].clone(),
            unix_ms: int(1)?,
            image_path: fields[2].clone(),
            point_id: fields[3].clone(),
            x: int(4)?,
            y: int(5)?,
            rgb,
        })
    }
}

/// Encodes one CSV line including the trailing newline. Fields containing a
/// delimiter, quote or line break are quoted with doubled inner quotes.
pub fn encode_line<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = String::new();
    for (i, f) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        let f = f.as_ref();
        if f.contains([',', '"', '\n', '\r']) {
            line.push('"');
            line.push_str(&f.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(f);
        }
    }
    line.push_str("\r\n");
    line
}

/// Parsed CSV text. `truncated` is set when the final record has no line
/// terminator, as happens when a file is read while still being written.
#[derive(Debug, Default)]
pub struct ParsedCsv {
    pub records: Vec<Vec<String>>,
    pub truncated: bool,
}

pub fn parse_csv(text: &str) -> Result<ParsedCsv> {
    let mut out = ParsedCsv::default();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    let mut dirty = false;

    while let Some(c) = chars.next() {
        dirty = true;
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut field));
                out.records.push(std::mem::take(&mut record));
                dirty = false;
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        out.truncated = true;
    } else if dirty {
        record.push(field);
        out.records.push(record);
        out.truncated = true;
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSummary {
    pub rows: usize,
    pub ticks: usize,
    pub out_of_bounds: usize,
    pub images: usize,
    pub first: Option<String>,
    pub last: Option<String>,
    pub truncated: bool,
}

/// Reads a record file back. A trailing unterminated line is dropped and
/// flagged rather than treated as corruption.
pub fn read_records(path: &Path) -> Result<(Vec<SampleRow>, bool)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut parsed = parse_csv(&text)?;
    if parsed.truncated {
        parsed.records.pop();
    }
    let mut records = parsed.records.into_iter();
    match records.next() {
        Some(h) if h.iter().map(String::as_str).eq(HEADER.iter().copied()) => {}
        Some(h) => return Err(anyhow!("unexpected header in {}: {:?}", path.display(), h)),
        None => return Ok((Vec::new(), parsed.truncated)),
    }
    let rows = records
        .enumerate()
        .map(|(i, fields)| {
            SampleRow::from_fields(&fields)
                .with_context(|| format!("{} line {}", path.display(), i + 2))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((rows, parsed.truncated))
}

pub fn summarize(path: &Path) -> Result<RecordSummary> {
    let (rows, truncated) = read_records(path)?;
    let ticks: BTreeSet<i64> = rows.iter().map(|r| r.unix_ms).collect();
    let images: BTreeSet<&str> = rows
        .iter()
        .map(|r| r.image_path.as_str())
        .filter(|p| !p.is_empty())
        .collect();
    Ok(RecordSummary {
        rows: rows.len(),
        ticks: ticks.len(),
        out_of_bounds: rows.iter().filter(|r| r.rgb.is_none()).count(),
        images: images.len(),
        first: rows.first().map(|r| r.timestamp_iso.clone()),
        last: rows.last().map(|r| r.timestamp_iso.clone()),
        truncated,
    })
}
