use std::fmt;

/// Address-like token naming one backend instance.
pub type Identity = String;

/// One line of an identity's record.
///
/// Records written at registration time only carry the repository name; the id is
/// filled in by a later line once the instance reports a created repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoRecord {
    pub name: String,
    pub id: Option<String>,
}

impl RepoRecord {
    pub fn new<N, I>(name: N, id: I) -> Self
    where
        N: Into<String>,
        I: Into<String>,
    {
        RepoRecord {
            name: name.into(),
            id: Some(id.into()),
        }
    }

    pub fn name_only<N: Into<String>>(name: N) -> Self {
        RepoRecord {
            name: name.into(),
            id: None,
        }
    }

    /// Whether the record can be written as a single `name [id]` line and read back unchanged.
    pub fn is_well_formed(&self) -> bool {
        is_record_field(&self.name) && self.id.as_deref().is_none_or(is_record_field)
    }

    /// Parses a whitespace separated `name [id]` line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(RepoRecord {
            name: name.to_string(),
            id: parts.next().map(String::from),
        })
    }
}

/// A repository name or id must be non-empty and free of whitespace and control characters.
pub fn is_record_field(field: &str) -> bool {
    !field.is_empty()
        && !field
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
}

impl fmt::Display for RepoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} {}", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            RepoRecord::parse_line("7db9a/demo 0xabc"),
            Some(RepoRecord::new("7db9a/demo", "0xabc"))
        );
        assert_eq!(
            RepoRecord::parse_line("  7db9a/demo\t0xabc  "),
            Some(RepoRecord::new("7db9a/demo", "0xabc"))
        );
        // Legacy name-only line
        assert_eq!(
            RepoRecord::parse_line("7db9a/demo"),
            Some(RepoRecord::name_only("7db9a/demo"))
        );
        assert_eq!(RepoRecord::parse_line("   "), None);
    }

    #[test]
    fn test_well_formed() {
        assert!(RepoRecord::new("7db9a/demo", "0xabc").is_well_formed());
        assert!(RepoRecord::name_only("7db9a/demo").is_well_formed());

        assert!(!RepoRecord::name_only("").is_well_formed());
        assert!(!RepoRecord::name_only("7db9a/my demo").is_well_formed());
        assert!(!RepoRecord::new("7db9a/demo", "").is_well_formed());
        assert!(!RepoRecord::new("7db9a/demo\nvictim/repo", "0xstolen").is_well_formed());
        assert!(!RepoRecord::new("7db9a/demo", "0xabc\t0xdef").is_well_formed());
        assert!(!RepoRecord::new("7db9a/demo", "0x\u{7f}").is_well_formed());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RepoRecord::new("7db9a/demo", "0xabc").to_string(),
            "7db9a/demo 0xabc"
        );
        assert_eq!(RepoRecord::name_only("7db9a/demo").to_string(), "7db9a/demo");
    }
}
