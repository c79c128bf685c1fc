use crate::CoreError;
use std::fmt;

/// Where a package build currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Initializing,
    Building,
    Committing,
    Committed,
    Aborted,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Building => "building",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl BuildPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

pub fn validate_transition(from: BuildPhase, to: BuildPhase) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (BuildPhase::Committed | BuildPhase::Aborted, BuildPhase::Initializing)
            | (BuildPhase::Initializing, BuildPhase::Building | BuildPhase::Aborted)
            | (BuildPhase::Building, BuildPhase::Committing | BuildPhase::Aborted)
            | (BuildPhase::Committing, BuildPhase::Committed | BuildPhase::Aborted)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
