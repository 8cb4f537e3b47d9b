use std::fmt;
use std::str::FromStr;

use super::BusError;

pub const SEPARATOR: char = '.';
pub const SINGLE_LEVEL_WILDCARD: &str = "*";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

/// Binding pattern over dot-separated topics.
///
/// `*` matches exactly one segment, `#` matches zero or more segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.is_empty() {
            return Err(BusError::invalid_topic(pattern, "pattern is empty"));
        }
        let segments = pattern
            .split(SEPARATOR)
            .map(|segment| match segment {
                "" => Err(BusError::invalid_topic(pattern, "empty segment")),
                SINGLE_LEVEL_WILDCARD => Ok(Segment::One),
                MULTI_LEVEL_WILDCARD => Ok(Segment::Rest),
                literal if literal.contains(['*', '#']) => {
                    Err(BusError::invalid_topic(pattern, "wildcards must fill a whole segment"))
                }
                literal => Ok(Segment::Literal(literal.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments.iter().any(|segment| !matches!(segment, Segment::Literal(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split(SEPARATOR).collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((Segment::Rest, rest)) => (0..=topic.len()).any(|skip| match_segments(rest, &topic[skip..])),
        Some((Segment::One, rest)) => !topic.is_empty() && match_segments(rest, &topic[1..]),
        Some((Segment::Literal(literal), rest)) => {
            topic.first() == Some(&literal.as_str()) && match_segments(rest, &topic[1..])
        }
    }
}

/// Checks a concrete publish topic: non-empty segments and no wildcards.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    let pattern = TopicPattern::parse(topic)?;
    if pattern.has_wildcards() {
        return Err(BusError::invalid_topic(topic, "publish topics cannot contain wildcards"));
    }
    Ok(())
}

impl FromStr for TopicPattern {
    type Err = BusError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        Self::parse(pattern)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(raw: &str) -> TopicPattern {
        TopicPattern::parse(raw).unwrap()
    }

    #[test]
    fn test_literal_match() {
        assert!(pattern("Epoch").matches("Epoch"));
        assert!(!pattern("Epoch").matches("Epoch.1"));
        assert!(!pattern("Status.Ready").matches("Status.Error"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let status = pattern("Status.*");
        assert!(status.matches("Status.Ready"));
        assert!(status.matches("Status.Error"));
        assert!(!status.matches("Status"));
        assert!(!status.matches("Status.Ready.Extra"));
        assert!(pattern("*.Ready").matches("Status.Ready"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(pattern("#").matches("SimState"));
        assert!(pattern("#").matches("a.b.c"));
        assert!(pattern("Status.#").matches("Status"));
        assert!(pattern("Status.#").matches("Status.Ready.Extra"));
        assert!(!pattern("Status.#").matches("Epoch"));

        let middle = pattern("a.#.c");
        assert!(middle.matches("a.c"));
        assert!(middle.matches("a.b.c"));
        assert!(middle.matches("a.b.d.c"));
        assert!(!middle.matches("a.b.d"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("a..b").is_err());
        assert!(TopicPattern::parse("Status.Re*").is_err());
        assert!(validate_topic("Status.*").is_err());
        assert!(validate_topic("Status.Ready").is_ok());
    }
}
