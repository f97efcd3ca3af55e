use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use uuid::Uuid;


/// Identifies a single unidirectional sequence. It is generated by the party that accepts a
///  CreateSequence (or offered by the party that sends it), and it never changes afterwards.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceId(Uuid);

impl SequenceId {
    const URN_PREFIX: &'static str = "urn:uuid:";

    pub fn new_unique() -> SequenceId {
        SequenceId(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> SequenceId {
        SequenceId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", Self::URN_PREFIX, self.0)
    }
}

impl Debug for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SequenceId({})", self.0)
    }
}

impl FromStr for SequenceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(Self::URN_PREFIX)
            .ok_or_else(|| anyhow!("sequence identifier {:?} is not a uuid urn", s))?;
        Ok(SequenceId(Uuid::parse_str(raw)?))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_unique() {
        assert_ne!(SequenceId::new_unique(), SequenceId::new_unique());
    }

    #[test]
    fn test_display_parse() {
        let id = SequenceId::new_unique();
        let parsed: SequenceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[rstest]
    #[case::no_prefix("8a1e3b2c-55f1-4f0e-9d1c-2b7fb6d0e6a1")]
    #[case::bad_uuid("urn:uuid:not-a-uuid")]
    #[case::empty("")]
    fn test_parse_invalid(#[case] raw: &str) {
        assert!(raw.parse::<SequenceId>().is_err());
    }
}
