use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    config::{FileSystem, ImageSource},
    error::{KeelError, ReportError, ServicingError},
};

/// Persisted record of what was deployed where. Written identically to the
/// state and recovery partitions so either copy can bootstrap a future
/// upgrade.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InstallState {
    /// RFC 3339 timestamp of the operation that produced this document.
    pub date: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partitions: BTreeMap<PartitionRecordKey, PartitionRecord>,
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionRecordKey {
    State,
    Recovery,
    Oem,
    Persistent,
}

#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageRecordKey {
    Active,
    Passive,
    Recovery,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PartitionRecord {
    pub fslabel: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<ImageRecordKey, ImageRecord>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImageRecord {
    /// The resolved source URI the image was deployed from.
    pub source: String,

    /// Deployment-time metadata reported by the deployer (image digest or
    /// similar), opaque to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_metadata: Option<String>,

    pub label: String,
    pub fs: String,
}

impl ImageRecord {
    pub fn new(
        source: &ImageSource,
        metadata: Option<String>,
        label: &str,
        fs: FileSystem,
    ) -> Self {
        ImageRecord {
            source: source.to_string(),
            source_metadata: metadata,
            label: label.to_string(),
            fs: fs.to_string(),
        }
    }
}

impl InstallState {
    pub fn new(date: String) -> Self {
        InstallState {
            date,
            partitions: BTreeMap::new(),
        }
    }

    /// Reads a previously persisted document. A missing file is not an
    /// error; a present but unparsable file is.
    pub fn load(path: &Path) -> Result<Option<Self>, KeelError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(path).structured(ServicingError::ReadState)?;
        let state = serde_yaml::from_str(&contents).structured(ServicingError::ReadState)?;
        Ok(Some(state))
    }

    pub fn write(&self, path: &Path) -> Result<(), KeelError> {
        let doc = serde_yaml::to_string(self).structured(ServicingError::WriteState)?;
        std::fs::write(path, doc).structured(ServicingError::WriteState)
    }

    /// Carries forward partition records a previous document knew about and
    /// this one does not. A reset that never touches the recovery partition
    /// keeps its recorded metadata this way.
    pub fn merge_previous(&mut self, previous: InstallState) {
        for (key, record) in previous.partitions {
            self.partitions.entry(key).or_insert(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstallState {
        let mut state = InstallState::new("2026-08-07T10:00:00+00:00".into());
        state.partitions.insert(
            PartitionRecordKey::State,
            PartitionRecord {
                fslabel: "COS_STATE".into(),
                images: BTreeMap::from([
                    (
                        ImageRecordKey::Active,
                        ImageRecord {
                            source: "oci://ghcr.io/acme/os:v2".into(),
                            source_metadata: Some("sha256:abc".into()),
                            label: "COS_ACTIVE".into(),
                            fs: "ext4".into(),
                        },
                    ),
                    (
                        ImageRecordKey::Passive,
                        ImageRecord {
                            source: "oci://ghcr.io/acme/os:v2".into(),
                            source_metadata: Some("sha256:abc".into()),
                            label: "COS_PASSIVE".into(),
                            fs: "ext4".into(),
                        },
                    ),
                ]),
            },
        );
        state
    }

    #[test]
    fn test_roundtrip() {
        let state = sample();
        let doc = serde_yaml::to_string(&state).unwrap();
        let parsed: InstallState = serde_yaml::from_str(&doc).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(InstallState::load(&dir.path().join("state.yaml")).unwrap(), None);
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yaml");
        let state = sample();
        state.write(&path).unwrap();
        assert_eq!(InstallState::load(&path).unwrap(), Some(state));
    }

    #[test]
    fn test_merge_keeps_unknown_partitions() {
        let mut previous = InstallState::new("2026-01-01T00:00:00+00:00".into());
        previous.partitions.insert(
            PartitionRecordKey::Recovery,
            PartitionRecord {
                fslabel: "COS_RECOVERY".into(),
                images: BTreeMap::from([(
                    ImageRecordKey::Recovery,
                    ImageRecord {
                        source: "file:///run/iso/recovery.img".into(),
                        source_metadata: None,
                        label: "COS_SYSTEM".into(),
                        fs: "ext4".into(),
                    },
                )]),
            },
        );

        let mut state = sample();
        state.merge_previous(previous.clone());

        assert_eq!(
            state.partitions.get(&PartitionRecordKey::Recovery),
            previous.partitions.get(&PartitionRecordKey::Recovery)
        );
        // Existing records win over carried-forward ones.
        assert!(state
            .partitions
            .get(&PartitionRecordKey::State)
            .unwrap()
            .images
            .contains_key(&ImageRecordKey::Active));
    }
}
