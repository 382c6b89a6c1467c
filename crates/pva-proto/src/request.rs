//! pvRequest parsing.
//!
//! A request selects a subset of a channel's structure and carries
//! per-operation options:
//!
//! ```text
//! request    := [ 'record[' option (',' option)* ']' ] body
//! body       := 'field(' selector ')' | selector
//! selector   := '' | field_path (',' field_path)*
//! field_path := ident ('.' ident)*
//! option     := ident '=' value
//! ```
//!
//! The bare-selector shorthand (`value,alarm`) is accepted for
//! convenience. Unknown record options are collected as warnings rather
//! than rejected, matching the tolerant behavior expected of request
//! handling; malformed syntax is an `InvalidRequest` error.

use crate::errors::{ProtocolError, Result};

/// Options from the `record[...]` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOptions {
    /// Monitor queue depth request.
    pub queue_size: Option<u32>,
    /// Flow-controlled monitor mode.
    pub pipeline: Option<bool>,
}

/// A parsed pvRequest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvRequest {
    /// Record-level options.
    pub record: RecordOptions,
    /// Selected dotted field paths; empty selects the whole structure.
    pub fields: Vec<String>,
    /// Non-fatal parse diagnostics (unknown options, duplicate fields).
    pub warnings: Vec<String>,
}

impl PvRequest {
    /// A request selecting everything with default options.
    pub fn all() -> Self {
        Self::default()
    }

    /// True when the request selects the whole structure.
    pub fn selects_all(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse the textual form.
    pub fn parse(text: &str) -> Result<Self> {
        let mut out = Self::default();
        let mut rest = text.trim();

        if let Some(after) = rest.strip_prefix("record[") {
            let end = after
                .find(']')
                .ok_or_else(|| ProtocolError::InvalidRequest("unterminated record[".into()))?;
            out.parse_options(&after[..end])?;
            rest = after[end + 1..].trim();
        }

        let selector = if let Some(after) = rest.strip_prefix("field(") {
            let end = after
                .rfind(')')
                .ok_or_else(|| ProtocolError::InvalidRequest("unterminated field(".into()))?;
            if !after[end + 1..].trim().is_empty() {
                return Err(ProtocolError::InvalidRequest("trailing input after field()".into()));
            }
            &after[..end]
        } else {
            rest
        };

        for raw in selector.split(',') {
            let path = raw.trim();
            if path.is_empty() {
                continue;
            }
            if !path.split('.').all(is_ident) {
                return Err(ProtocolError::InvalidRequest(format!(
                    "invalid field path '{path}'"
                )));
            }
            if out.fields.iter().any(|f| f == path) {
                out.warnings.push(format!("duplicate field '{path}'"));
                continue;
            }
            out.fields.push(path.to_owned());
        }

        Ok(out)
    }

    fn parse_options(&mut self, text: &str) -> Result<()> {
        for raw in text.split(',') {
            let opt = raw.trim();
            if opt.is_empty() {
                continue;
            }
            let (key, value) = opt.split_once('=').ok_or_else(|| {
                ProtocolError::InvalidRequest(format!("option '{opt}' is not key=value"))
            })?;
            match key.trim() {
                "queueSize" => {
                    let n = value.trim().parse::<u32>().map_err(|_| {
                        ProtocolError::InvalidRequest(format!("invalid queueSize '{value}'"))
                    })?;
                    self.record.queue_size = Some(n);
                }
                "pipeline" => {
                    let b = match value.trim() {
                        "true" | "1" => true,
                        "false" | "0" => false,
                        other => {
                            return Err(ProtocolError::InvalidRequest(format!(
                                "invalid pipeline '{other}'"
                            )));
                        }
                    };
                    self.record.pipeline = Some(b);
                }
                other => {
                    self.warnings.push(format!("ignoring unknown option '{other}'"));
                }
            }
        }
        Ok(())
    }

    /// Canonical textual form, suitable for retransmission.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut opts = Vec::new();
        if let Some(n) = self.record.queue_size {
            opts.push(format!("queueSize={n}"));
        }
        if let Some(b) = self.record.pipeline {
            opts.push(format!("pipeline={b}"));
        }
        if !opts.is_empty() {
            out.push_str("record[");
            out.push_str(&opts.join(","));
            out.push(']');
        }
        out.push_str("field(");
        out.push_str(&self.fields.join(","));
        out.push(')');
        out
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
