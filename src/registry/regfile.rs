//! Reader and writer for the native registry export format (`.reg`).
//!
//! Only what `reg export` produces is understood: a version header, key
//! sections, and `"name"=<data>` lines with `\` continuations. Files written
//! by `reg export` are UTF-16LE with a BOM; UTF-8 input is accepted too.

use anyhow::{Context, Result, bail};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const HEADER_V5: &str = "Windows Registry Editor Version 5.00";
const HEADER_V4: &str = "REGEDIT4";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegValue {
    String(String),
    Dword(u32),
    Binary(Vec<u8>),
    /// `hex(N):` data of any other registry type
    Typed { kind: u32, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegKey {
    pub path: String,
    /// In file order; the empty name is the key's default value
    pub values: Vec<(String, RegValue)>,
}

impl RegKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            values: Vec::new(),
        }
    }

    pub fn value_names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegFile {
    pub keys: Vec<RegKey>,
}

impl RegFile {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read registry export: {:?}", path))?;
        let text = decode(&bytes).with_context(|| format!("Invalid encoding in {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Failed to parse registry export: {:?}", path))
    }

    /// Write in the same encoding `reg export` uses
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, encode_utf16(&self.to_text()))
            .with_context(|| format!("Failed to write registry export: {:?}", path))
    }

    /// Key section by path, compared case-insensitively like the registry
    pub fn key(&self, path: &str) -> Option<&RegKey> {
        self.keys.iter().find(|k| k.path.eq_ignore_ascii_case(path))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = logical_lines(text).into_iter();

        let header = lines
            .by_ref()
            .find(|l| !l.is_empty())
            .context("Empty registry export")?;
        if header != HEADER_V5 && header != HEADER_V4 {
            bail!("Unknown registry export header: {}", header);
        }

        let mut file = RegFile::default();
        // None while inside a `[-KEY]` deletion section
        let mut current: Option<RegKey> = None;

        for line in lines {
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[') {
                let path = section
                    .strip_suffix(']')
                    .with_context(|| format!("Unterminated key section: {}", line))?;
                if let Some(key) = current.take() {
                    file.keys.push(key);
                }
                if !path.starts_with('-') {
                    current = Some(RegKey::new(path));
                }
                continue;
            }

            let Some(key) = current.as_mut() else {
                continue;
            };
            let (name, data) = parse_value_line(&line)?;
            if let Some(value) = data {
                key.values.push((name, value));
            }
        }

        if let Some(key) = current {
            file.keys.push(key);
        }
        Ok(file)
    }

    pub fn to_text(&self) -> String {
        let mut out = format!("{}\r\n\r\n", HEADER_V5);
        for key in &self.keys {
            let _ = write!(out, "[{}]\r\n", key.path);
            for (name, value) in &key.values {
                if name.is_empty() {
                    out.push('@');
                } else {
                    let _ = write!(out, "\"{}\"", escape(name));
                }
                out.push('=');
                out.push_str(&format_data(value));
                out.push_str("\r\n");
            }
            out.push_str("\r\n");
        }
        out
    }
}

/// Decode an export file: UTF-16LE with BOM, or UTF-8 with optional BOM
pub fn decode(bytes: &[u8]) -> Result<String> {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        if rest.len() % 2 != 0 {
            bail!("Odd byte count in UTF-16 data");
        }
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16(&units).context("Invalid UTF-16 data");
    }

    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).context("Invalid UTF-8 data")
}

pub fn encode_utf16(text: &str) -> Vec<u8> {
    let mut out = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Split into lines and join `\`-continued hex data
fn logical_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = String::new();

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        let piece = if pending.is_empty() { line } else { line.trim_start() };

        match piece.strip_suffix('\\') {
            Some(head) => pending.push_str(head),
            None => {
                pending.push_str(piece);
                out.push(std::mem::take(&mut pending).trim().to_string());
            }
        }
    }
    if !pending.is_empty() {
        out.push(pending.trim().to_string());
    }
    out
}

/// Returns the value name and its data, or `None` data for `"name"=-`
fn parse_value_line(line: &str) -> Result<(String, Option<RegValue>)> {
    let (name, rest) = if let Some(rest) = line.strip_prefix('@') {
        (String::new(), rest)
    } else if line.starts_with('"') {
        parse_quoted(line)?
    } else {
        bail!("Malformed value line: {}", line);
    };

    let data = rest
        .trim_start()
        .strip_prefix('=')
        .with_context(|| format!("Missing '=' in value line: {}", line))?
        .trim();

    if data == "-" {
        return Ok((name, None));
    }
    Ok((name, Some(parse_data(data)?)))
}

/// Parse a leading `"..."` string; returns it unescaped plus the remainder
fn parse_quoted(s: &str) -> Result<(String, &str)> {
    let body = s.strip_prefix('"').context("Expected opening quote")?;
    let mut out = String::new();
    let mut chars = body.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, esc)) => out.push(esc),
                None => bail!("Dangling escape in: {}", s),
            },
            '"' => return Ok((out, &body[i + 1..])),
            _ => out.push(c),
        }
    }
    bail!("Unterminated string in: {}", s)
}

fn parse_data(data: &str) -> Result<RegValue> {
    if data.starts_with('"') {
        let (text, rest) = parse_quoted(data)?;
        if !rest.trim().is_empty() {
            bail!("Trailing characters after string value: {}", data);
        }
        return Ok(RegValue::String(text));
    }
    if let Some(hex) = data.strip_prefix("dword:") {
        let n = u32::from_str_radix(hex.trim(), 16)
            .with_context(|| format!("Invalid dword: {}", hex))?;
        return Ok(RegValue::Dword(n));
    }
    if let Some(hex) = data.strip_prefix("hex:") {
        return Ok(RegValue::Binary(parse_hex_bytes(hex)?));
    }
    if let Some(rest) = data.strip_prefix("hex(") {
        let (kind, hex) = rest
            .split_once("):")
            .with_context(|| format!("Malformed typed value: {}", data))?;
        let kind = u32::from_str_radix(kind, 16)
            .with_context(|| format!("Invalid value type: {}", kind))?;
        return Ok(RegValue::Typed {
            kind,
            data: parse_hex_bytes(hex)?,
        });
    }
    bail!("Unsupported value data: {}", data)
}

fn parse_hex_bytes(hex: &str) -> Result<Vec<u8>> {
    hex.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(|b| u8::from_str_radix(b, 16).with_context(|| format!("Invalid hex byte: {}", b)))
        .collect()
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn hex_list(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(",")
}

fn format_data(value: &RegValue) -> String {
    match value {
        RegValue::String(s) => format!("\"{}\"", escape(s)),
        RegValue::Dword(n) => format!("dword:{:08x}", n),
        RegValue::Binary(bytes) => format!("hex:{}", hex_list(bytes)),
        RegValue::Typed { kind, data } => format!("hex({:x}):{}", kind, hex_list(data)),
    }
}
