//! Device and store security classification.

/// Data sensitivity label of a store or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLabel {
    /// The device does not report labels.
    NotSupport,
    /// No label configured.
    NotSet,
    /// Public data.
    S0,
    /// Low sensitivity.
    S1,
    /// Medium sensitivity.
    S2,
    /// High sensitivity.
    S3,
    /// Critical sensitivity.
    S4,
}

/// Access flag attached to a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityFlag {
    /// Readable once the device is unlocked.
    #[default]
    Ece,
    /// Readable while the device stays unlocked.
    Sece,
}

/// A label plus its access flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityOption {
    /// Sensitivity label.
    pub label: SecurityLabel,
    /// Access flag.
    pub flag: SecurityFlag,
}

impl SecurityOption {
    /// Creates an option with the default flag.
    pub fn new(label: SecurityLabel) -> Self {
        Self {
            label,
            flag: SecurityFlag::default(),
        }
    }

    /// Sets the access flag.
    #[must_use]
    pub fn with_flag(mut self, flag: SecurityFlag) -> Self {
        self.flag = flag;
        self
    }

    /// Option reported by a device that has no label support.
    pub fn not_support() -> Self {
        Self::new(SecurityLabel::NotSupport)
    }

    /// Returns true if labels are not reported.
    pub fn is_not_support(&self) -> bool {
        self.label == SecurityLabel::NotSupport
    }
}
