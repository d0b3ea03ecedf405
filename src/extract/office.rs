//! Office Open XML text extraction (docx, xlsx, pptx).
//!
//! The primary extractors understand each format's part layout. The secondary
//! extractor strips tags from every XML part of the container, or pulls
//! printable runs out of legacy binary files that are not zip containers.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::OnceLock;

use regex::Regex;
use zip::ZipArchive;

use crate::classify::DocFormat;
use crate::{Result, SweepError};

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

struct Patterns {
    paragraph: Regex,
    word_text: Regex,
    shared_item: Regex,
    any_text: Regex,
    cell: Regex,
    cell_type: Regex,
    cell_value: Regex,
    drawing_text: Regex,
    tag: Regex,
    part_number: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        paragraph: Regex::new(r"(?s)<w:p[ >].*?</w:p>").expect("valid regex"),
        word_text: Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>").expect("valid regex"),
        shared_item: Regex::new(r"(?s)<si>(.*?)</si>").expect("valid regex"),
        any_text: Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>").expect("valid regex"),
        cell: Regex::new(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)").expect("valid regex"),
        cell_type: Regex::new(r#"\bt="([^"]*)""#).expect("valid regex"),
        cell_value: Regex::new(r"(?s)<v>(.*?)</v>").expect("valid regex"),
        drawing_text: Regex::new(r"(?s)<a:t>(.*?)</a:t>").expect("valid regex"),
        tag: Regex::new(r"(?s)<[^>]+>").expect("valid regex"),
        part_number: Regex::new(r"(\d+)\.xml$").expect("valid regex"),
    })
}

/// Format-aware extraction.
pub fn primary(format: DocFormat, bytes: &[u8]) -> Result<String> {
    let mut archive = open(bytes)?;
    match format {
        DocFormat::Word => docx_text(&mut archive),
        DocFormat::Spreadsheet => xlsx_text(&mut archive),
        DocFormat::Presentation => pptx_text(&mut archive),
        other => Err(SweepError::Extraction(format!(
            "{} is not an office format",
            other.as_str()
        ))),
    }
}

/// Tag-stripping over every XML part, or printable runs for non-zip files.
pub fn secondary(bytes: &[u8]) -> Result<String> {
    let mut archive = match open(bytes) {
        Ok(archive) => archive,
        Err(_) => return Ok(printable_runs(bytes)),
    };

    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort();

    let mut chunks = Vec::new();
    for name in names {
        if let Ok(xml) = read_part(&mut archive, &name) {
            let text = patterns().tag.replace_all(&xml, " ");
            let text = unescape_xml(text.trim());
            if !text.trim().is_empty() {
                chunks.push(text);
            }
        }
    }
    Ok(chunks.join("\n"))
}

fn open(bytes: &[u8]) -> Result<Archive<'_>> {
    ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| SweepError::Extraction(format!("not an office container: {}", e)))
}

fn read_part(archive: &mut Archive<'_>, name: &str) -> Result<String> {
    let mut part = archive
        .by_name(name)
        .map_err(|e| SweepError::Extraction(format!("{}: {}", name, e)))?;
    let mut xml = String::new();
    part.read_to_string(&mut xml)?;
    Ok(xml)
}

/// Names of numbered parts under `prefix` (`slide1.xml`, `slide2.xml`, ...),
/// sorted by number.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut parts: Vec<(u32, String)> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .filter_map(|n| {
            let number = patterns()
                .part_number
                .captures(n)?
                .get(1)?
                .as_str()
                .parse()
                .ok()?;
            Some((number, n.to_string()))
        })
        .collect();
    parts.sort();
    parts.into_iter().map(|(_, n)| n).collect()
}

fn docx_text(archive: &mut Archive<'_>) -> Result<String> {
    let xml = read_part(archive, "word/document.xml")?;
    let p = patterns();
    let paragraphs: Vec<String> = p
        .paragraph
        .find_iter(&xml)
        .map(|para| {
            p.word_text
                .captures_iter(para.as_str())
                .filter_map(|c| c.get(1))
                .map(|m| unescape_xml(m.as_str()))
                .collect::<String>()
        })
        .filter(|text| !text.trim().is_empty())
        .collect();
    Ok(paragraphs.join("\n"))
}

fn xlsx_text(archive: &mut Archive<'_>) -> Result<String> {
    let p = patterns();
    let shared: Vec<String> = match read_part(archive, "xl/sharedStrings.xml") {
        Ok(xml) => p
            .shared_item
            .captures_iter(&xml)
            .filter_map(|c| c.get(1))
            .map(|item| {
                p.any_text
                    .captures_iter(item.as_str())
                    .filter_map(|c| c.get(1))
                    .map(|m| unescape_xml(m.as_str()))
                    .collect::<String>()
            })
            .collect(),
        Err(_) => Vec::new(),
    };

    let mut sheets = Vec::new();
    for name in numbered_parts(archive, "xl/worksheets/sheet") {
        let xml = read_part(archive, &name)?;
        let cells: Vec<String> = p
            .cell
            .captures_iter(&xml)
            .filter_map(|c| {
                let attrs = c.get(1).map(|m| m.as_str()).unwrap_or_default();
                let body = c.get(2)?.as_str();
                let kind = p
                    .cell_type
                    .captures(attrs)
                    .and_then(|t| t.get(1))
                    .map(|m| m.as_str())
                    .unwrap_or("n");
                cell_text(kind, body, &shared)
            })
            .filter(|v| !v.trim().is_empty())
            .collect();
        if !cells.is_empty() {
            sheets.push(cells.join(" "));
        }
    }
    Ok(sheets.join("\n"))
}

fn cell_text(kind: &str, body: &str, shared: &[String]) -> Option<String> {
    let p = patterns();
    match kind {
        "s" => {
            let index: usize = p.cell_value.captures(body)?.get(1)?.as_str().trim().parse().ok()?;
            shared.get(index).cloned()
        }
        "inlineStr" => Some(
            p.any_text
                .captures_iter(body)
                .filter_map(|c| c.get(1))
                .map(|m| unescape_xml(m.as_str()))
                .collect(),
        ),
        _ => p
            .cell_value
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| unescape_xml(m.as_str())),
    }
}

fn pptx_text(archive: &mut Archive<'_>) -> Result<String> {
    let p = patterns();
    let mut slides = Vec::new();
    for name in numbered_parts(archive, "ppt/slides/slide") {
        let xml = read_part(archive, &name)?;
        let runs: Vec<String> = p
            .drawing_text
            .captures_iter(&xml)
            .filter_map(|c| c.get(1))
            .map(|m| unescape_xml(m.as_str()))
            .collect();
        if !runs.is_empty() {
            slides.push(runs.join(" "));
        }
    }
    Ok(slides.join("\n"))
}

fn unescape_xml(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let entities: HashMap<&str, &str> = [
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&apos;", "'"),
    ]
    .into_iter()
    .collect();
    let mut out = text.to_string();
    for (entity, plain) in entities {
        out = out.replace(entity, plain);
    }
    // last, so "&amp;lt;" stays "&lt;"
    out.replace("&amp;", "&")
}

/// Runs of at least four printable ASCII characters.
fn printable_runs(bytes: &[u8]) -> String {
    let mut runs = Vec::new();
    let mut current = String::new();
    for &b in bytes {
        if b.is_ascii_graphic() || b == b' ' {
            current.push(b as char);
        } else {
            if current.trim().len() >= 4 {
                runs.push(current.trim().to_string());
            }
            current.clear();
        }
    }
    if current.trim().len() >= 4 {
        runs.push(current.trim().to_string());
    }
    runs.join(" ")
}
