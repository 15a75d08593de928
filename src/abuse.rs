//! Abusive content detection
//!
//! Case-insensitive word list plus regex patterns, applied to the request
//! path, query string, the `x-custom-data` header and the buffered body.
//! Stateless: patterns are compiled once at construction.

use axum::http::HeaderMap;
use regex::Regex;
use tracing::debug;
use url::form_urlencoded;

use crate::config::AbuseConfig;

/// Header carrying free-form client data that is inspected alongside the body
pub const CUSTOM_DATA_HEADER: &str = "x-custom-data";

/// Where abusive content was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseLocation {
    Path,
    Query,
    Header,
    Body,
}

impl AbuseLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Body => "body",
        }
    }
}

/// Detection result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbuseVerdict {
    Clean,
    Abusive {
        location: AbuseLocation,
        /// Word or pattern that matched
        matched: String,
    },
}

impl AbuseVerdict {
    pub fn is_abusive(&self) -> bool {
        matches!(self, Self::Abusive { .. })
    }
}

/// Request data for inspection
pub struct AbuseRequest<'a> {
    pub path: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
    /// Request body bytes (already limited to `max_body_scan_bytes`)
    pub body: Option<&'a [u8]>,
}

/// Compiled word list and patterns
pub struct AbuseDetector {
    words: Vec<String>,
    patterns: Vec<Regex>,
    enabled: bool,
    max_body_scan_bytes: usize,
}

impl AbuseDetector {
    pub fn new(config: &AbuseConfig) -> Self {
        Self {
            words: config
                .words
                .iter()
                .filter(|w| !w.is_empty())
                .map(|w| w.to_lowercase())
                .collect(),
            patterns: compile_patterns(&config.patterns),
            enabled: config.enabled,
            max_body_scan_bytes: config.max_body_scan_bytes,
        }
    }

    /// Detector that never matches
    pub fn disabled() -> Self {
        Self {
            words: Vec::new(),
            patterns: Vec::new(),
            enabled: false,
            max_body_scan_bytes: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Largest body buffered for inspection
    pub fn max_body_scan_bytes(&self) -> usize {
        self.max_body_scan_bytes
    }

    /// Matching word or pattern in `text`, if any
    pub fn find_abuse(&self, text: &str) -> Option<String> {
        if !self.enabled || text.is_empty() {
            return None;
        }

        let lowered = text.to_lowercase();
        if let Some(word) = self.words.iter().find(|w| lowered.contains(w.as_str())) {
            return Some(word.clone());
        }

        self.patterns
            .iter()
            .find(|p| p.is_match(&lowered))
            .map(|p| p.as_str().to_string())
    }

    pub fn is_abusive(&self, text: &str) -> bool {
        self.find_abuse(text).is_some()
    }

    /// Inspect every request location in order: path, query, header, body
    pub fn inspect(&self, req: &AbuseRequest<'_>) -> AbuseVerdict {
        if !self.enabled {
            return AbuseVerdict::Clean;
        }

        // Invalid UTF-8 is replaced, never skipped
        let header = req
            .headers
            .get(CUSTOM_DATA_HEADER)
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
            .unwrap_or_default();
        let body = req.body.map(String::from_utf8_lossy).unwrap_or_default();
        let query = decode_query(req.query);

        let locations = [
            (AbuseLocation::Path, req.path),
            (AbuseLocation::Query, query.as_str()),
            (AbuseLocation::Header, header.as_ref()),
            (AbuseLocation::Body, body.as_ref()),
        ];

        for (location, text) in locations {
            if let Some(matched) = self.find_abuse(text) {
                debug!("Abusive content in {}: {}", location.as_str(), matched);
                return AbuseVerdict::Abusive { location, matched };
            }
        }

        AbuseVerdict::Clean
    }
}

/// Percent-decode query pairs into `key=value&...`
fn decode_query(raw: &str) -> String {
    form_urlencoded::parse(raw.as_bytes())
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compile regex patterns, logging and skipping invalid ones
fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            Regex::new(p)
                .map_err(|e| tracing::error!("Failed to compile abuse pattern '{}': {}", p, e))
                .ok()
        })
        .collect()
}
