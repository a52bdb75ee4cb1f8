//! Named-field header blocks with continuation-line folding.
//!
//! Used both for record headers in the header-block profile and for
//! `application/warc-fields` bodies (metadata, warcinfo). Entries keep their
//! insertion order; lookups are case-insensitive. An entry may be a bare
//! label with no value (e.g. `seed`).

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};

const CRLF: &str = "\r\n";

/// One entry of a header block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Label text.
    pub name: String,
    /// Value, absent for label-only entries.
    pub value: Option<String>,
}

/// Insertion-ordered list of named fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBlock {
    fields: Vec<Field>,
}

impl HeaderBlock {
    /// Create an empty block.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Append `name: value`. Multi-line values (LF or CRLF separated) are
    /// folded when encoded.
    pub fn push(&mut self, name: &str, value: &str) -> ArchiveResult<()> {
        check_label(name)?;
        let value = value.replace("\r\n", "\n");
        check_value(&value)?;
        self.fields.push(Field {
            name: name.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    /// Append a label-only entry.
    pub fn push_label(&mut self, name: &str) -> ArchiveResult<()> {
        check_label(name)?;
        self.fields.push(Field {
            name: name.to_string(),
            value: None,
        });
        Ok(())
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .and_then(|f| f.value.as_deref())
    }

    /// Every value for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(name))
            .filter_map(|f| f.value.as_deref())
    }

    /// True when an entry (valued or label-only) named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Write every entry as CRLF-terminated lines, without the closing blank line.
    pub fn write_fields(&self, out: &mut String) {
        for field in &self.fields {
            out.push_str(&field.name);
            if let Some(value) = &field.value {
                out.push_str(": ");
                let mut lines = value.split('\n');
                if let Some(first) = lines.next() {
                    out.push_str(first);
                }
                for cont in lines {
                    out.push_str(CRLF);
                    out.push(' ');
                    out.push_str(cont);
                }
            }
            out.push_str(CRLF);
        }
    }

    /// Encode as a standalone block terminated by a blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        self.write_fields(&mut out);
        out.push_str(CRLF);
        out.into_bytes()
    }

    /// Parse lines up to the first blank line, unfolding continuations.
    pub fn parse(text: &str) -> ArchiveResult<Self> {
        let mut block = HeaderBlock::new();
        for raw in text.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                break;
            }
            if let Some(cont) = line.strip_prefix(' ').or_else(|| line.strip_prefix('\t')) {
                let last = block
                    .fields
                    .last_mut()
                    .ok_or_else(|| ArchiveError::parse(0, "continuation line before any field"))?;
                let value = last.value.get_or_insert_with(String::new);
                value.push('\n');
                value.push_str(cont);
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    let name = name.trim_end();
                    check_label(name).map_err(|e| ArchiveError::parse(0, e.to_string()))?;
                    let value = value.strip_prefix(' ').unwrap_or(value);
                    block.fields.push(Field {
                        name: name.to_string(),
                        value: Some(value.to_string()),
                    });
                }
                None => {
                    let line = line.trim_end();
                    check_label(line).map_err(|e| ArchiveError::parse(0, e.to_string()))?;
                    block.fields.push(Field {
                        name: line.to_string(),
                        value: None,
                    });
                }
            }
        }
        Ok(block)
    }
}

fn check_label(name: &str) -> ArchiveResult<()> {
    if name.is_empty() {
        return Err(ArchiveError::format("label", "empty label"));
    }
    if let Some(c) = name.chars().find(|c| *c == ':' || c.is_control()) {
        return Err(ArchiveError::format(
            "label",
            format!("label {:?} contains disallowed character {:?}", name, c),
        ));
    }
    if name.starts_with(char::is_whitespace) || name.ends_with(char::is_whitespace) {
        return Err(ArchiveError::format("label", "label starts or ends with white space"));
    }
    Ok(())
}

fn check_value(value: &str) -> ArchiveResult<()> {
    // LF is folded on output; a bare CR would be ambiguous.
    if let Some(c) = value.chars().find(|c| c.is_control() && *c != '\n' && *c != '\t') {
        return Err(ArchiveError::format(
            "value",
            format!("value contains disallowed control character {:?}", c),
        ));
    }
    Ok(())
}
