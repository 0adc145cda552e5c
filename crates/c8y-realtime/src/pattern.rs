// ── Channel pattern matching ──
//
// Subscription patterns use `*` as a whole-segment wildcard:
// `/alarms/*` matches `/alarms/12345` but not `/events/12345`, and the
// wildcard never crosses a `/` boundary. Pure -- no state, no side effects.

use crate::error::Error;

/// A compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl ChannelPattern {
    /// Compile a pattern string.
    ///
    /// `*` must stand alone as a segment; other characters in a segment
    /// are matched literally. An empty pattern, or `*` glued to literal
    /// characters within one segment, is rejected -- no partial matcher
    /// is ever produced.
    pub fn compile(pattern: &str) -> Result<Self, Error> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: pattern.into(),
                reason: "pattern is empty".into(),
            });
        }

        let segments = pattern
            .split('/')
            .map(|seg| {
                if seg == "*" {
                    Ok(Segment::Wildcard)
                } else if seg.contains('*') {
                    Err(Error::InvalidPattern {
                        pattern: pattern.into(),
                        reason: format!("wildcard must be a whole segment, got {seg:?}"),
                    })
                } else {
                    Ok(Segment::Literal(seg.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The original pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Test a channel name against this pattern.
    pub fn matches(&self, channel: &str) -> bool {
        let mut segments = channel.split('/');

        for expected in &self.segments {
            let Some(actual) = segments.next() else {
                return false;
            };
            match expected {
                Segment::Wildcard => {}
                Segment::Literal(lit) => {
                    if lit != actual {
                        return false;
                    }
                }
            }
        }

        segments.next().is_none()
    }
}

impl std::fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
