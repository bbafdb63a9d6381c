//! FITS file I/O for captured frames
//!
//! Writes single-HDU, 16-bit unsigned mono images the way downstream
//! astrophotography tools expect them:
//! - 2880-byte blocks
//! - Header with 80-character keyword records
//! - Data in big-endian format, BZERO = 32768
//! - Rows stored bottom-up (`ROWORDER = 'BOTTOM-UP'`)
//!
//! `write_fits` only returns `Ok` after the file has been flushed and
//! `sync_all` has succeeded, so callers can treat success as durable.

use crate::RawFrame;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const BLOCK: usize = 2880;
const RECORD: usize = 80;
/// Longest string value that still fits a card with both quotes
const MAX_STRING_LEN: usize = 68;

/// Keywords the writer produces itself; caller values for these are ignored.
const STRUCTURAL: [&str; 9] = [
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "BZERO", "BSCALE", "ROWORDER", "END",
];

/// FITS header containing all keywords
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    /// Keyword-value pairs
    pub keywords: HashMap<String, FitsValue>,
    /// Keywords in order (for writing)
    keyword_order: Vec<String>,
}

/// FITS value types
#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl FitsValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            FitsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FitsValue::Integer(i) => Some(*i),
            FitsValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FitsValue::Float(f) => Some(*f),
            FitsValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Render as the value field of a header card.
    fn to_card_value(&self) -> String {
        match self {
            FitsValue::String(s) => {
                // Columns 11..80 hold the quoted string; never split a '' pair
                let mut escaped = String::with_capacity(s.len().min(MAX_STRING_LEN));
                for c in s.chars() {
                    let width = if c == '\'' { 2 } else { c.len_utf8() };
                    if escaped.len() + width > MAX_STRING_LEN {
                        break;
                    }
                    if c == '\'' {
                        escaped.push_str("''");
                    } else {
                        escaped.push(c);
                    }
                }
                format!("'{:<8}'", escaped)
            }
            FitsValue::Integer(i) => i.to_string(),
            FitsValue::Float(f) => format!("{:.10E}", f),
            FitsValue::Boolean(b) => if *b { "T".to_string() } else { "F".to_string() },
        }
    }
}

impl std::fmt::Display for FitsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitsValue::String(s) => write!(f, "{}", s),
            FitsValue::Integer(i) => write!(f, "{}", i),
            FitsValue::Float(v) => write!(f, "{}", v),
            FitsValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, key: &str, value: FitsValue) {
        let key_upper = key.to_uppercase();
        if !self.keyword_order.contains(&key_upper) {
            self.keyword_order.push(key_upper.clone());
        }
        self.keywords.insert(key_upper, value);
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, FitsValue::String(value.to_string()));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, FitsValue::Integer(value));
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        self.set(key, FitsValue::Float(value));
    }

    pub fn get(&self, key: &str) -> Option<&FitsValue> {
        self.keywords.get(&key.to_uppercase())
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_string())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    /// Keywords in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FitsValue)> {
        self.keyword_order
            .iter()
            .filter_map(move |k| self.keywords.get(k).map(|v| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.keyword_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyword_order.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum FitsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid FITS format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported BITPIX: {0}")]
    UnsupportedBitpix(i64),
    #[error("Missing required keyword: {0}")]
    MissingKeyword(String),
}

/// Write a frame to disk and make it durable.
///
/// The file is created (or truncated), written, flushed and `fsync`ed.
/// Any failure along the way is returned; a partially written file may
/// remain on disk in that case and is never reported as saved.
pub fn write_fits(path: &Path, frame: &RawFrame, header: &FitsHeader) -> Result<(), FitsError> {
    if !frame.is_consistent() {
        return Err(FitsError::InvalidFormat(format!(
            "{} pixels for a {}x{} frame",
            frame.pixels.len(),
            frame.width,
            frame.height
        )));
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut records = 0usize;
    let mut card = |w: &mut BufWriter<File>, k: &str, v: &str| -> Result<(), FitsError> {
        records += 1;
        write_keyword(w, k, v)
    };

    card(&mut writer, "SIMPLE", "T")?;
    card(&mut writer, "BITPIX", "16")?;
    card(&mut writer, "NAXIS", "2")?;
    card(&mut writer, "NAXIS1", &frame.width.to_string())?;
    card(&mut writer, "NAXIS2", &frame.height.to_string())?;
    card(&mut writer, "BZERO", "32768")?;
    card(&mut writer, "BSCALE", "1")?;
    card(&mut writer, "ROWORDER", "'BOTTOM-UP'")?;

    for (key, value) in header.iter() {
        if STRUCTURAL.contains(&key) {
            continue;
        }
        card(&mut writer, key, &value.to_card_value())?;
    }

    card(&mut writer, "END", "")?;

    // Pad header to 2880-byte boundary
    let padding = (BLOCK - (records * RECORD) % BLOCK) % BLOCK;
    writer.write_all(&vec![b' '; padding])?;

    // Bottom-up: last sensor row first
    for y in (0..frame.height).rev() {
        for &val in frame.row(y) {
            let signed = (val as i32 - 32768) as i16;
            writer.write_all(&signed.to_be_bytes())?;
        }
    }

    let data_size = frame.pixels.len() * 2;
    let padding = (BLOCK - (data_size % BLOCK)) % BLOCK;
    writer.write_all(&vec![0u8; padding])?;

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| FitsError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

/// Read a frame written by [`write_fits`] (or any 16-bit mono FITS).
pub fn read_fits(path: &Path) -> Result<(RawFrame, FitsHeader), FitsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    read_fits_from_reader(&mut reader)
}

fn read_fits_from_reader<R: Read>(reader: &mut R) -> Result<(RawFrame, FitsHeader), FitsError> {
    let header = read_header(reader)?;

    let bitpix = header
        .get_int("BITPIX")
        .ok_or_else(|| FitsError::MissingKeyword("BITPIX".to_string()))?;
    if bitpix != 16 {
        return Err(FitsError::UnsupportedBitpix(bitpix));
    }
    let width = header
        .get_int("NAXIS1")
        .ok_or_else(|| FitsError::MissingKeyword("NAXIS1".to_string()))? as u32;
    let height = header
        .get_int("NAXIS2")
        .ok_or_else(|| FitsError::MissingKeyword("NAXIS2".to_string()))? as u32;
    let bzero = header.get_float("BZERO").unwrap_or(0.0);
    let bit_depth = header.get_int("BITDEPTH").unwrap_or(16) as u8;

    let count = width as usize * height as usize;
    let mut bytes = vec![0u8; count * 2];
    reader.read_exact(&mut bytes)?;

    let mut pixels: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| {
            let v = i16::from_be_bytes([c[0], c[1]]) as f64 + bzero;
            v.clamp(0.0, 65535.0) as u16
        })
        .collect();

    if header.get_string("ROWORDER") == Some("BOTTOM-UP") && width > 0 {
        let w = width as usize;
        let mut flipped = Vec::with_capacity(pixels.len());
        for row in pixels.chunks_exact(w).rev() {
            flipped.extend_from_slice(row);
        }
        pixels = flipped;
    }

    Ok((RawFrame::new(width, height, bit_depth, pixels), header))
}

/// Read the FITS header (80-character records until END)
fn read_header<R: Read>(reader: &mut R) -> Result<FitsHeader, FitsError> {
    let mut header = FitsHeader::new();
    let mut buffer = [0u8; RECORD];
    let mut records = 0usize;

    loop {
        reader.read_exact(&mut buffer)?;
        records += 1;

        let record = String::from_utf8_lossy(&buffer);
        let keyword = record.get(..8).unwrap_or("").trim().to_string();

        if keyword == "END" {
            break;
        }
        if keyword.is_empty() {
            continue;
        }
        if record.get(8..10) == Some("= ") {
            let value = parse_fits_value(record.get(10..).unwrap_or(""));
            header.set(&keyword, value);
        }
        if records > 36 * 100 {
            return Err(FitsError::InvalidFormat("no END record".to_string()));
        }
    }

    let padding = (BLOCK - (records * RECORD) % BLOCK) % BLOCK;
    if padding > 0 {
        let mut skip = vec![0u8; padding];
        reader.read_exact(&mut skip)?;
    }

    Ok(header)
}

/// Parse a FITS value from string
fn parse_fits_value(s: &str) -> FitsValue {
    let s = s.trim();

    if let Some(rest) = s.strip_prefix('\'') {
        // '' is an escaped quote inside the string
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push('\'');
                    continue;
                }
                break;
            }
            out.push(c);
        }
        return FitsValue::String(out.trim_end().to_string());
    }

    let value_part = match s.find('/') {
        Some(idx) => s[..idx].trim(),
        None => s,
    };

    if value_part == "T" {
        return FitsValue::Boolean(true);
    }
    if value_part == "F" {
        return FitsValue::Boolean(false);
    }
    if let Ok(i) = value_part.parse::<i64>() {
        return FitsValue::Integer(i);
    }
    if let Ok(f) = value_part.replace('D', "E").parse::<f64>() {
        return FitsValue::Float(f);
    }

    FitsValue::String(value_part.to_string())
}

/// Write a single keyword record
fn write_keyword<W: Write>(writer: &mut W, keyword: &str, value: &str) -> Result<(), FitsError> {
    let mut record = [b' '; RECORD];

    let keyword_bytes = keyword.as_bytes();
    let keyword_len = keyword_bytes.len().min(8);
    record[..keyword_len].copy_from_slice(&keyword_bytes[..keyword_len]);

    if keyword != "END" && !value.is_empty() {
        record[8] = b'=';
        record[9] = b' ';

        // Strings start at column 11, numbers are right-justified to column 30
        let value_bytes = value.as_bytes();
        let start = if value.starts_with('\'') {
            10
        } else {
            30_usize.saturating_sub(value_bytes.len()).max(10)
        };
        let value_len = value_bytes.len().min(RECORD - start);
        record[start..start + value_len].copy_from_slice(&value_bytes[..value_len]);
    }

    writer.write_all(&record)?;
    Ok(())
}
