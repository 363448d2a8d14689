//! Ordered regular-expression chain scanned against every relayed chunk.

use regex::bytes::Regex;

/// Upper bound on matches reported for one pattern over one chunk. Hitting it
/// sets [`PatternScan::truncated`].
pub const MAX_MATCHES_PER_SCAN: usize = 512;

#[derive(Debug, thiserror::Error)]
#[error("invalid pattern `{source_text}`: {error}")]
pub struct PatternError {
    source_text: String,
    #[source]
    error: regex::Error,
}

/// A compiled pattern together with the text it was compiled from.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(source).map_err(|error| PatternError {
            source_text: source.to_string(),
            error,
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// One non-empty match inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match<'a> {
    pub start: usize,
    pub bytes: &'a [u8],
}

/// Result of scanning one chunk with one pattern.
#[derive(Debug)]
pub struct PatternScan<'p, 'a> {
    pub pattern: &'p Pattern,
    pub matches: Vec<Match<'a>>,
    /// More matches existed past [`MAX_MATCHES_PER_SCAN`].
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    patterns: Vec<Pattern>,
}

impl FilterChain {
    /// Compiles `sources` in order. The first bad pattern fails the whole chain.
    pub fn compile<I, S>(sources: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = sources
            .into_iter()
            .map(|source| Pattern::compile(source.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Scans `chunk` with every pattern in chain order.
    ///
    /// Each pattern walks the chunk left to right, resuming at the end of the
    /// previous match, so matches never overlap. Nothing carries over between
    /// chunks.
    #[must_use]
    pub fn scan<'a>(&self, chunk: &'a [u8]) -> Vec<PatternScan<'_, 'a>> {
        self.patterns
            .iter()
            .map(|pattern| {
                let mut found = pattern
                    .regex
                    .find_iter(chunk)
                    .filter(|m| m.start() < m.end())
                    .map(|m| Match {
                        start: m.start(),
                        bytes: m.as_bytes(),
                    });
                let matches: Vec<_> = found.by_ref().take(MAX_MATCHES_PER_SCAN).collect();
                let truncated = found.next().is_some();
                PatternScan {
                    pattern,
                    matches,
                    truncated,
                }
            })
            .collect()
    }
}
