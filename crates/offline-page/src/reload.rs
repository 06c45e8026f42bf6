//! One-shot reload guard.

/// Lets exactly one controller change reload the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadGuard {
    #[default]
    Armed,
    Consumed,
}

impl ReloadGuard {
    pub fn new() -> Self {
        Self::Armed
    }

    /// Returns true the first time only.
    pub fn try_consume(&mut self) -> bool {
        match self {
            Self::Armed => {
                *self = Self::Consumed;
                true
            }
            Self::Consumed => false,
        }
    }

    pub fn is_consumed(&self) -> bool {
        *self == Self::Consumed
    }
}
