//! Scan configuration.
//!
//! [`Settings`] is the single versioned knob set read by the scheduler and
//! the scanner adapter. Updates go through [`Settings::apply`] with a
//! [`SettingsPatch`]: the patch is validated against a copy first, so a bad
//! update leaves the current configuration untouched. Every accepted update
//! bumps `version`.
//!
//! Settings take effect for chunks promoted after the update; supervisors
//! snapshot their configuration when their chunk starts.

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Timing preset passed to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanProfile {
    Fast,
    Balanced,
    Thorough,
}

impl ScanProfile {
    /// Scanner argv fragment for this preset.
    pub(crate) fn timing_args(self) -> &'static [&'static str] {
        match self {
            ScanProfile::Fast | ScanProfile::Balanced => &["-T4", "--max-retries", "1"],
            ScanProfile::Thorough => &["-T3", "--max-retries", "2"],
        }
    }
}

/// Versioned scan configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Chunks allowed to run concurrently.
    pub max_workers: usize,
    /// Host scans allowed to run concurrently within one chunk.
    pub per_host_workers: usize,
    /// Wall clock budget for a single host scan, in seconds.
    pub host_timeout_sec: u64,
    /// Advisory chunk budget, in seconds. Enforced only by a caller that
    /// decides to kill.
    pub chunk_timeout_sec: u64,
    pub profile: ScanProfile,
    /// Scan-mode flag fragment, e.g. `sT` or `sS`.
    pub scan_type: String,
    /// Either `top-N` or a literal port list such as `1-1024,3389`.
    pub ports: String,
    /// Extra argv tokens, split by shell quoting rules.
    pub extra_args: String,
    /// Bumped on every accepted update.
    #[serde(default)]
    pub version: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: 2,
            per_host_workers: 8,
            host_timeout_sec: 60,
            chunk_timeout_sec: 1800,
            profile: ScanProfile::Balanced,
            // sS needs raw-socket capabilities, sT does not.
            scan_type: "sT".to_string(),
            ports: "top-1000".to_string(),
            extra_args: String::new(),
            version: 0,
        }
    }
}

impl Settings {
    /// Checks the recognized options. Rejections carry the field name.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.max_workers == 0 {
            return Err(ControlError::Input("max_workers must be at least 1".into()));
        }
        if self.per_host_workers == 0 {
            return Err(ControlError::Input(
                "per_host_workers must be at least 1".into(),
            ));
        }
        if self.host_timeout_sec == 0 {
            return Err(ControlError::Input(
                "host_timeout_sec must be at least 1".into(),
            ));
        }
        if self.scan_type.is_empty() || !self.scan_type.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ControlError::Input(format!(
                "scan_type `{}` is not a valid scan-mode flag",
                self.scan_type
            )));
        }
        if shlex::split(&self.extra_args).is_none() {
            return Err(ControlError::Input(format!(
                "extra_args `{}` has unbalanced quoting",
                self.extra_args
            )));
        }
        Ok(())
    }

    /// Applies a patch atomically: either every field lands and `version`
    /// is bumped, or the settings are left as they were.
    pub fn apply(&mut self, patch: SettingsPatch) -> Result<(), ControlError> {
        let mut next = self.clone();
        if let Some(v) = patch.max_workers {
            next.max_workers = v;
        }
        if let Some(v) = patch.per_host_workers {
            next.per_host_workers = v;
        }
        if let Some(v) = patch.host_timeout_sec {
            next.host_timeout_sec = v;
        }
        if let Some(v) = patch.chunk_timeout_sec {
            next.chunk_timeout_sec = v;
        }
        if let Some(v) = patch.profile {
            next.profile = v;
        }
        if let Some(v) = patch.scan_type {
            next.scan_type = v;
        }
        if let Some(v) = patch.ports {
            next.ports = v;
        }
        if let Some(v) = patch.extra_args {
            next.extra_args = v;
        }
        next.validate()?;
        next.version = self.version + 1;
        *self = next;
        Ok(())
    }
}

/// Partial settings update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_host_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_timeout_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_timeout_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ScanProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<String>,
}
