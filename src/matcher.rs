//! Stateless response-pattern matching.
//!
//! AT responses and NMEA sentences are treated as opaque text matched
//! against a named set of compiled patterns. A [`PatternSet`] holds the
//! patterns in declaration order; [`PatternSet::first_match`] returns the
//! first pattern that matches the accumulated buffer, together with any
//! named capture groups.
//!
//! Declaration order matters: two flags in a discovery battery can have
//! ambiguously similar responses (IMEI and IMSI are both bare digit
//! strings), and the battery relies on checking flags in the same order the
//! commands are issued. Patterns therefore anchor on the echoed command
//! wherever the bare response would be ambiguous.

use crate::error::{EngineError, EngineResult};
use regex::Regex;
use std::collections::BTreeMap;

/// One successful match: the pattern's name plus its captured fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternMatch {
    pub name: String,
    pub fields: BTreeMap<String, String>,
    /// Byte offset one past the end of the match in the scanned buffer,
    /// so the caller can consume exactly the matched span.
    pub end: usize,
}

/// A named, ordered set of compiled patterns.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<(String, Regex)>,
}

impl PatternSet {
    /// Compile `(name, regex)` pairs, preserving order.
    pub fn compile(specs: &[(&str, &str)]) -> EngineResult<Self> {
        let mut patterns = Vec::with_capacity(specs.len());
        for (name, source) in specs {
            let regex = Regex::new(source).map_err(|e| EngineError::Pattern {
                name: (*name).to_string(),
                message: e.to_string(),
            })?;
            patterns.push(((*name).to_string(), regex));
        }
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(name, _)| name.as_str())
    }

    /// Match the buffer against every pattern in order and return the first
    /// hit, or `None`. Named capture groups become the match's field map;
    /// a group that did not participate is omitted.
    pub fn first_match(&self, buffer: &str) -> Option<PatternMatch> {
        for (name, regex) in &self.patterns {
            if let Some(captures) = regex.captures(buffer) {
                let mut fields = BTreeMap::new();
                for group in regex.capture_names().flatten() {
                    if let Some(value) = captures.name(group) {
                        fields.insert(group.to_string(), value.as_str().to_string());
                    }
                }
                return Some(PatternMatch {
                    name: name.clone(),
                    fields,
                    end: captures.get(0).map_or(0, |whole| whole.end()),
                });
            }
        }
        None
    }

    /// Match the buffer against one specific named pattern.
    pub fn match_named(&self, name: &str, buffer: &str) -> Option<PatternMatch> {
        let (pattern_name, regex) = self
            .patterns
            .iter()
            .find(|(candidate, _)| candidate == name)?;
        let captures = regex.captures(buffer)?;
        let mut fields = BTreeMap::new();
        for group in regex.capture_names().flatten() {
            if let Some(value) = captures.name(group) {
                fields.insert(group.to_string(), value.as_str().to_string());
            }
        }
        Some(PatternMatch {
            name: pattern_name.clone(),
            fields,
            end: captures.get(0).map_or(0, |whole| whole.end()),
        })
    }
}
