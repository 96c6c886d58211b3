use std::collections::BTreeMap;

use crate::{Outlink, Section, Task, TaskStatus, VaultPath};

#[derive(Debug, Clone)]
pub(crate) struct ParsedNote {
    pub title: String,
    pub frontmatter: BTreeMap<String, serde_yaml::Value>,
    pub aliases: Vec<String>,
    pub tags: Vec<String>,
    pub outlinks: Vec<Outlink>,
    pub sections: Vec<Section>,
    pub tasks: Vec<Task>,
    pub warnings: Vec<String>,
}

/// Tracks fenced code blocks across lines. Both ``` and ~~~ fences are
/// recognised; a block closes only on the marker that opened it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceTracker {
    open: Option<u8>,
}

impl FenceTracker {
    /// Feed one line; returns true when the line itself is a fence marker.
    pub fn observe(&mut self, line: &str) -> bool {
        let t = line.trim_start();
        let marker = if t.starts_with("```") {
            Some(b'`')
        } else if t.starts_with("~~~") {
            Some(b'~')
        } else {
            None
        };
        let Some(m) = marker else {
            return false;
        };
        match self.open {
            None => self.open = Some(m),
            Some(open) if open == m => self.open = None,
            // A ~~~ line inside a ``` block (or vice versa) is content.
            Some(_) => return false,
        }
        true
    }

    pub fn in_fence(&self) -> bool {
        self.open.is_some()
    }
}

/// Replace inline code spans with spaces, preserving byte offsets.
///
/// Spans are delimited by equal-length backtick runs; an unpaired run is
/// left as-is.
pub fn mask_inline_code(line: &str) -> String {
    let bytes = line.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }
        let run_start = i;
        while i < bytes.len() && bytes[i] == b'`' {
            i += 1;
        }
        let run_len = i - run_start;

        // Look for a closing run of the same length.
        let mut j = i;
        let mut close: Option<usize> = None;
        while j < bytes.len() {
            if bytes[j] == b'`' {
                let cs = j;
                while j < bytes.len() && bytes[j] == b'`' {
                    j += 1;
                }
                if j - cs == run_len {
                    close = Some(cs);
                    break;
                }
            } else {
                j += 1;
            }
        }

        if let Some(cs) = close {
            for b in out.iter_mut().take(cs + run_len).skip(run_start) {
                *b = b' ';
            }
            i = cs + run_len;
        }
    }
    // Masking only touches ASCII backticks, so the result stays valid UTF-8.
    String::from_utf8(out).unwrap_or_else(|_| line.to_string())
}

pub(crate) fn parse_note(path: &VaultPath, bytes: &[u8]) -> ParsedNote {
    let mut warnings = Vec::new();

    let content = match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => {
            warnings.push("Not UTF-8".to_string());
            return empty_note(path, warnings);
        }
    };
    if content.trim().is_empty() {
        warnings.push("Empty file".to_string());
        return empty_note(path, warnings);
    }

    let (frontmatter, fm_warning, body, body_offset, body_start_line) =
        split_frontmatter(content);
    if let Some(w) = fm_warning {
        warnings.push(w);
    }

    let aliases = extract_string_list(&frontmatter, &["aliases", "alias"]);
    let mut tags = extract_string_list(&frontmatter, &["tags", "tag"]);

    let mut outlinks = Vec::new();
    let mut sections = Vec::new();
    let mut tasks = Vec::new();
    let mut first_h1: Option<String> = None;

    let mut fences = FenceTracker::default();
    let mut offset = body_offset;
    let mut line_no = body_start_line;
    // Open sections by heading level; closed when a heading of equal or
    // shallower level arrives, or at EOF.
    let mut open: Vec<Section> = Vec::new();

    for line in body.split_inclusive('\n') {
        let line_len = line.len();
        let stripped = line.trim_end_matches(['\n', '\r']);

        if fences.observe(stripped) {
            offset += line_len;
            line_no += 1;
            continue;
        }
        if fences.in_fence() {
            offset += line_len;
            line_no += 1;
            continue;
        }

        if let Some((level, heading)) = parse_atx_heading(stripped) {
            while open.last().is_some_and(|s| s.level >= level) {
                if let Some(mut done) = open.pop() {
                    done.end = offset;
                    done.end_line = line_no;
                    sections.push(done);
                }
            }
            if level == 1 && first_h1.is_none() && !heading.is_empty() {
                first_h1 = Some(heading.clone());
            }
            open.push(Section {
                heading,
                level,
                heading_line: line_no,
                end_line: 0,
                start: offset,
                body_start: offset + line_len,
                end: 0,
            });
            offset += line_len;
            line_no += 1;
            continue;
        }

        let masked = mask_inline_code(stripped);
        extract_wikilinks(&masked, line_no, &mut outlinks);
        extract_inline_tags(&masked, &mut tags);
        if let Some((status, text)) = parse_task_line(&masked) {
            tasks.push(Task {
                line: line_no,
                status,
                text,
            });
        }

        offset += line_len;
        line_no += 1;
    }

    while let Some(mut done) = open.pop() {
        done.end = content.len();
        done.end_line = line_no;
        sections.push(done);
    }
    sections.sort_by_key(|s| s.start);

    dedup_case_preserving(&mut tags);

    let title = extract_title(path, &frontmatter, first_h1);

    ParsedNote {
        title,
        frontmatter,
        aliases,
        tags,
        outlinks,
        sections,
        tasks,
        warnings,
    }
}

/// Byte offset and 1-based line where the body begins, after any
/// frontmatter block.
pub(crate) fn body_start(content: &str) -> (usize, u32) {
    let (_, _, _, offset, line) = split_frontmatter(content);
    (offset, line)
}

fn empty_note(path: &VaultPath, warnings: Vec<String>) -> ParsedNote {
    ParsedNote {
        title: fallback_title(path),
        frontmatter: BTreeMap::new(),
        aliases: Vec::new(),
        tags: Vec::new(),
        outlinks: Vec::new(),
        sections: Vec::new(),
        tasks: Vec::new(),
        warnings,
    }
}

fn fallback_title(path: &VaultPath) -> String {
    let stem = path.stem();
    if stem.is_empty() {
        "untitled".to_string()
    } else {
        stem.to_string()
    }
}

fn extract_title(
    path: &VaultPath,
    fm: &BTreeMap<String, serde_yaml::Value>,
    first_h1: Option<String>,
) -> String {
    if let Some(serde_yaml::Value::String(s)) = fm.get("title") {
        let s = s.trim();
        if !s.is_empty() {
            return s.to_string();
        }
    }
    if let Some(h) = first_h1 {
        return h;
    }
    fallback_title(path)
}

/// Split a leading `---` frontmatter block; returns (mapping, warning, body,
/// body byte offset, 1-based body start line).
fn split_frontmatter(
    content: &str,
) -> (
    BTreeMap<String, serde_yaml::Value>,
    Option<String>,
    &str,
    usize,
    u32,
) {
    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (BTreeMap::new(), None, content, 0, 1);
    };

    let mut idx = 0usize;
    let bytes = rest.as_bytes();
    while idx < bytes.len() {
        let line_end = match bytes[idx..].iter().position(|b| *b == b'\n') {
            Some(off) => idx + off + 1,
            None => bytes.len(),
        };
        let line = rest[idx..line_end].trim_end_matches(['\r', '\n']);
        if line == "---" {
            let fm_text = &rest[..idx];
            let body = &rest[line_end..];
            let body_offset = content.len() - body.len();
            let start_line = 1 + content[..body_offset]
                .bytes()
                .filter(|b| *b == b'\n')
                .count() as u32;
            return match serde_yaml::from_str::<serde_yaml::Value>(fm_text) {
                Ok(serde_yaml::Value::Mapping(map)) => {
                    let mut out = BTreeMap::new();
                    for (k, v) in map {
                        if let serde_yaml::Value::String(key) = k {
                            out.insert(key, v);
                        }
                    }
                    (out, None, body, body_offset, start_line)
                }
                Ok(serde_yaml::Value::Null) => {
                    (BTreeMap::new(), None, body, body_offset, start_line)
                }
                Ok(_) => (
                    BTreeMap::new(),
                    Some("frontmatter is not a mapping".to_string()),
                    body,
                    body_offset,
                    start_line,
                ),
                Err(err) => (
                    BTreeMap::new(),
                    Some(format!("malformed frontmatter: {err}")),
                    body,
                    body_offset,
                    start_line,
                ),
            };
        }
        idx = line_end;
    }

    (
        BTreeMap::new(),
        Some("frontmatter fence not closed".to_string()),
        content,
        0,
        1,
    )
}

fn extract_string_list(
    fm: &BTreeMap<String, serde_yaml::Value>,
    keys: &[&str],
) -> Vec<String> {
    let mut out = Vec::new();
    for key in keys {
        let Some(v) = fm.get(*key) else {
            continue;
        };
        match v {
            serde_yaml::Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    out.push(s.to_string());
                }
            }
            serde_yaml::Value::Sequence(seq) => {
                for item in seq {
                    if let Some(s) = item.as_str() {
                        let s = s.trim();
                        if !s.is_empty() {
                            out.push(s.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    dedup_case_preserving(&mut out);
    out
}

/// Case-preserving dedup: first casing wins, comparison is case-folded.
fn dedup_case_preserving(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|s| seen.insert(s.to_lowercase()));
}

fn parse_atx_heading(line: &str) -> Option<(u8, String)> {
    let mut level = 0usize;
    let bytes = line.as_bytes();
    while level < bytes.len() && bytes[level] == b'#' {
        level += 1;
    }
    if level == 0 || level > 6 {
        return None;
    }
    if bytes.get(level) != Some(&b' ') {
        return None;
    }
    let heading = line[level + 1..].trim().to_string();
    Some((level as u8, heading))
}

fn extract_wikilinks(line: &str, line_no: u32, out: &mut Vec<Outlink>) {
    let bytes = line.as_bytes();
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] != b'[' || bytes[i + 1] != b'[' {
            i += 1;
            continue;
        }
        let inner_start = i + 2;
        let mut j = inner_start;
        let mut close: Option<usize> = None;
        while j + 1 < bytes.len() {
            if bytes[j] == b']' && bytes[j + 1] == b']' {
                close = Some(j);
                break;
            }
            j += 1;
        }
        let Some(close) = close else {
            break;
        };
        let inner = &line[inner_start..close];

        // Target runs to the first '|' or ']'; remainder is the display.
        let (target_raw, display) = match inner.split_once('|') {
            Some((t, d)) => (t, Some(d.trim().to_string()).filter(|d| !d.is_empty())),
            None => (inner, None),
        };
        // Drop a heading fragment; backlinks are note-level.
        let target_raw = target_raw.split('#').next().unwrap_or(target_raw).trim();
        if !target_raw.is_empty() {
            out.push(Outlink {
                target: target_raw.to_string(),
                display,
                line: line_no,
            });
        }

        i = close + 2;
    }
}

fn extract_inline_tags(line: &str, out: &mut Vec<String>) {
    // Don't pick up fragments inside wikilink targets.
    let line = mask_wikilinks(line);
    let bytes = line.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'#' {
            i += 1;
            continue;
        }
        // Headings are handled separately; "# " is never a tag.
        if bytes.get(i + 1) == Some(&b' ') {
            i += 1;
            continue;
        }
        // Require a boundary before '#'.
        if i > 0 {
            let prev = bytes[i - 1] as char;
            if prev.is_ascii_alphanumeric() || prev == '#' {
                i += 1;
                continue;
            }
        }

        let mut j = i + 1;
        while j < bytes.len() && is_tag_byte(bytes[j]) {
            j += 1;
        }
        if j > i + 1 {
            out.push(line[i + 1..j].to_string());
        }
        i = j.max(i + 1);
    }
}

fn mask_wikilinks(line: &str) -> std::borrow::Cow<'_, str> {
    if !line.contains("[[") {
        return std::borrow::Cow::Borrowed(line);
    }
    let bytes = line.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'[' {
            let mut j = i + 2;
            while j + 1 < bytes.len() && !(bytes[j] == b']' && bytes[j + 1] == b']') {
                j += 1;
            }
            if j + 1 < bytes.len() {
                for b in out.iter_mut().take(j + 2).skip(i) {
                    if b.is_ascii() {
                        *b = b' ';
                    }
                }
                i = j + 2;
                continue;
            }
        }
        i += 1;
    }
    match String::from_utf8(out) {
        Ok(s) => std::borrow::Cow::Owned(s),
        Err(_) => std::borrow::Cow::Borrowed(line),
    }
}

fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn parse_task_line(line: &str) -> Option<(TaskStatus, String)> {
    let s = line.trim_start();
    let mut rest = s;

    if let Some(r) = rest
        .strip_prefix("- ")
        .or_else(|| rest.strip_prefix("* "))
        .or_else(|| rest.strip_prefix("+ "))
    {
        rest = r;
    } else {
        // Ordered list: "1. " or "1) "
        let bytes = rest.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == 0 || i + 1 >= bytes.len() {
            return None;
        }
        if bytes[i] != b'.' && bytes[i] != b')' {
            return None;
        }
        if bytes[i + 1] != b' ' {
            return None;
        }
        rest = &rest[i + 2..];
    }

    let bytes = rest.as_bytes();
    if bytes.len() < 3 || bytes[0] != b'[' || bytes[2] != b']' {
        return None;
    }
    let status = match bytes[1] as char {
        ' ' => TaskStatus::Todo,
        'x' | 'X' => TaskStatus::Done,
        '>' => TaskStatus::InProgress,
        '-' => TaskStatus::Cancelled,
        '?' => TaskStatus::Blocked,
        _ => return None,
    };
    Some((status, rest[3..].trim_start().to_string()))
}
