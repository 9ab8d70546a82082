use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,

    #[error("topic {0:?} has an empty segment")]
    EmptySegment(String),

    #[error("topic {0:?} uses '#' before the final segment")]
    MultiWildcardNotLast(String),

    #[error("topic {0:?} mixes wildcards into a literal segment")]
    MixedWildcard(String),
}

/// One level of a topic path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    /// `+`: exactly one level
    Single,
    /// `#`: one or more trailing levels
    Multi,
}

impl Segment {
    fn as_str(&self) -> &str {
        match self {
            Segment::Literal(s) => s,
            Segment::Single => "+",
            Segment::Multi => "#",
        }
    }
}

/// A slash-separated topic path, possibly containing wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    segments: Vec<Segment>,
}

impl Topic {
    pub fn parse(path: &str) -> Result<Self, TopicError> {
        if path.is_empty() {
            return Err(TopicError::Empty);
        }

        let raw: Vec<&str> = path.split('/').collect();
        let last = raw.len() - 1;
        let mut segments = Vec::with_capacity(raw.len());

        for (i, part) in raw.iter().enumerate() {
            let segment = match *part {
                "" => return Err(TopicError::EmptySegment(path.to_string())),
                "+" => Segment::Single,
                "#" if i == last => Segment::Multi,
                "#" => return Err(TopicError::MultiWildcardNotLast(path.to_string())),
                literal if literal.contains(['+', '#']) => {
                    return Err(TopicError::MixedWildcard(path.to_string()))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// A topic is publishable when it contains no wildcards.
    pub fn is_publishable(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Match a concrete topic against this pattern.
    ///
    /// Returns the wildcard captures in order, or `None` when the topic does not match.
    /// A `#` capture is the remaining levels joined with `/`.
    pub fn matches(&self, concrete: &str) -> Option<Vec<String>> {
        let levels: Vec<&str> = concrete.split('/').collect();
        let mut captures = Vec::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(expected) => {
                    if levels.get(i) != Some(&expected.as_str()) {
                        return None;
                    }
                }
                Segment::Single => {
                    let level = levels.get(i)?;
                    if level.is_empty() {
                        return None;
                    }
                    captures.push(level.to_string());
                }
                Segment::Multi => {
                    if i >= levels.len() {
                        return None;
                    }
                    captures.push(levels[i..].join("/"));
                    return Some(captures);
                }
            }
        }

        if levels.len() == self.segments.len() {
            Some(captures)
        } else {
            None
        }
    }

    /// Append a relative path to this topic.
    pub fn join(&self, suffix: &str) -> Result<Self, TopicError> {
        if suffix.is_empty() {
            return Ok(self.clone());
        }
        Topic::parse(&format!("{}/{}", self, suffix))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.segments.iter().map(Segment::as_str).collect();
        write!(f, "{}", parts.join("/"))
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}
