use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    constants,
    error::{InitializationError, KeelError, ReportError},
};

/// Where an image's content comes from. Resolved once per operation; `None`
/// means the slot is populated by copying another already-deployed slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ImageSource {
    #[default]
    None,
    /// A local image file, mounted and copied from.
    File(PathBuf),
    /// A local directory tree, copied verbatim.
    Dir(PathBuf),
    /// A container image reference, pulled and unpacked.
    Oci(String),
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported source scheme '{0}'")]
pub struct UnknownSchemeError(String);

impl Display for ImageSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::None => Ok(()),
            ImageSource::File(p) => write!(f, "file://{}", p.display()),
            ImageSource::Dir(p) => write!(f, "dir://{}", p.display()),
            ImageSource::Oci(r) => write!(f, "oci://{r}"),
        }
    }
}

impl FromStr for ImageSource {
    type Err = UnknownSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(ImageSource::None);
        }
        match s.split_once("://") {
            None => Ok(ImageSource::File(PathBuf::from(s))),
            Some(("file", rest)) => Ok(ImageSource::File(PathBuf::from(rest))),
            Some(("dir", rest)) => Ok(ImageSource::Dir(PathBuf::from(rest))),
            Some(("oci" | "docker" | "container", rest)) => Ok(ImageSource::Oci(rest.to_string())),
            Some((scheme, _)) => Err(UnknownSchemeError(scheme.to_string())),
        }
    }
}

impl Serialize for ImageSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ImageSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl ImageSource {
    pub fn is_none(&self) -> bool {
        matches!(self, ImageSource::None)
    }
}

/// Filesystem written into a slot image.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileSystem {
    Ext2,
    #[default]
    Ext4,
    Squashfs,
    Vfat,
}

impl FileSystem {
    /// Squashfs images are immutable; they are never relabeled in place.
    pub fn is_squashfs(&self) -> bool {
        matches!(self, FileSystem::Squashfs)
    }
}

/// One deployable slot image.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSpec {
    /// Content source, resolved once per operation.
    pub source: ImageSource,
    /// Final on-disk location of the image file.
    pub file: PathBuf,
    /// Where the image is loop-mounted while being populated.
    pub mount_point: PathBuf,
    /// Filesystem label stamped into the image.
    pub label: String,
    pub fs: FileSystem,
    /// Size of a freshly created image file, in MiB.
    pub size_mib: u64,
}

/// Partition roles the agent knows about.
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
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionRole {
    State,
    Recovery,
    Persistent,
    Oem,
    Efi,
}

/// An optional mount point plus the filesystem label used to locate the
/// partition's block device.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PartitionSpec {
    pub mount_point: Option<PathBuf>,
    pub label: String,
}

/// The partitions an operation works against. Absent entries are simply not
/// touched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PartitionMap {
    pub state: Option<PartitionSpec>,
    pub recovery: Option<PartitionSpec>,
    pub persistent: Option<PartitionSpec>,
    pub oem: Option<PartitionSpec>,
    pub efi: Option<PartitionSpec>,
}

impl PartitionMap {
    pub fn get(&self, role: PartitionRole) -> Option<&PartitionSpec> {
        match role {
            PartitionRole::State => self.state.as_ref(),
            PartitionRole::Recovery => self.recovery.as_ref(),
            PartitionRole::Persistent => self.persistent.as_ref(),
            PartitionRole::Oem => self.oem.as_ref(),
            PartitionRole::Efi => self.efi.as_ref(),
        }
    }

    /// All configured partitions in mount order (state first, EFI last).
    pub fn configured(&self) -> Vec<(PartitionRole, &PartitionSpec)> {
        [
            PartitionRole::State,
            PartitionRole::Recovery,
            PartitionRole::Persistent,
            PartitionRole::Oem,
            PartitionRole::Efi,
        ]
        .into_iter()
        .filter_map(|role| self.get(role).map(|spec| (role, spec)))
        .collect()
    }
}

/// Which image slot the running system was booted from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BootRole {
    Active,
    Passive,
    Recovery,
    Unknown,
}

/// Role a system extension is enabled for. `Common` extensions apply to
/// every boot role.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ExtensionRole {
    Active,
    Passive,
    Recovery,
    Common,
}

impl ExtensionRole {
    /// Whether an extension enabled for this role may be merged into the
    /// running system right now.
    pub fn matches_boot(&self, booted: BootRole) -> bool {
        match self {
            ExtensionRole::Common => true,
            ExtensionRole::Active => booted == BootRole::Active,
            ExtensionRole::Passive => booted == BootRole::Passive,
            ExtensionRole::Recovery => booted == BootRole::Recovery,
        }
    }
}

/// Everything an install needs. Constructed once per invocation; the target
/// and image sources may be rewritten in place by the orchestrator (device
/// auto-detection, ISO-derived sources).
#[derive(Clone, Debug, Default)]
pub struct InstallSpec {
    pub target: Option<PathBuf>,
    pub iso: Option<String>,
    pub active: ImageSpec,
    pub passive: ImageSpec,
    pub recovery: ImageSpec,
    pub partitions: PartitionMap,
    pub no_format: bool,
    pub force: bool,
    pub eject_cd: bool,
    pub cloud_init: Vec<String>,
    pub extra_dirs: Vec<PathBuf>,
    pub bind_mounts: BTreeMap<PathBuf, PathBuf>,
    pub strict_hooks: bool,
}

/// Everything an upgrade needs.
#[derive(Clone, Debug, Default)]
pub struct UpgradeSpec {
    pub recovery_upgrade: bool,
    pub active: ImageSpec,
    pub passive: ImageSpec,
    pub recovery: ImageSpec,
    pub partitions: PartitionMap,
    pub extra_dirs: Vec<PathBuf>,
    pub bind_mounts: BTreeMap<PathBuf, PathBuf>,
    pub strict_hooks: bool,
}

impl UpgradeSpec {
    /// The image being upgraded: recovery when the flag is set, else active.
    pub fn target_image(&self) -> &ImageSpec {
        if self.recovery_upgrade {
            &self.recovery
        } else {
            &self.active
        }
    }
}

/// Everything a factory reset needs.
#[derive(Clone, Debug, Default)]
pub struct ResetSpec {
    pub active: ImageSpec,
    pub passive: ImageSpec,
    pub partitions: PartitionMap,
    pub format_persistent: bool,
    pub format_oem: bool,
    pub reboot: bool,
    pub poweroff: bool,
    pub extra_dirs: Vec<PathBuf>,
    pub bind_mounts: BTreeMap<PathBuf, PathBuf>,
    pub strict_hooks: bool,
}

/// The agent configuration document, loaded from YAML. Operation specs are
/// derived from it plus CLI flags.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub device: Option<PathBuf>,
    pub iso: Option<String>,
    pub partitions: PartitionMap,
    pub active: ImageSpec,
    pub passive: ImageSpec,
    pub recovery: ImageSpec,
    pub no_format: bool,
    pub force: bool,
    pub eject_cd: bool,
    pub format_persistent: bool,
    pub format_oem: bool,
    pub reboot: bool,
    pub poweroff: bool,
    pub strict_hooks: bool,
    pub cloud_init: Vec<String>,
    pub extra_dirs: Vec<PathBuf>,
    pub bind_mounts: BTreeMap<PathBuf, PathBuf>,
    /// Commands to run per lifecycle stage, keyed by stage name.
    pub hooks: BTreeMap<String, Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let state_mount = Path::new(constants::STATE_MOUNT_POINT);
        let recovery_mount = Path::new(constants::RECOVERY_MOUNT_POINT);
        AgentConfig {
            device: None,
            iso: None,
            partitions: PartitionMap {
                state: Some(PartitionSpec {
                    mount_point: Some(state_mount.into()),
                    label: constants::STATE_LABEL.into(),
                }),
                recovery: Some(PartitionSpec {
                    mount_point: Some(recovery_mount.into()),
                    label: constants::RECOVERY_LABEL.into(),
                }),
                persistent: Some(PartitionSpec {
                    mount_point: Some(constants::PERSISTENT_MOUNT_POINT.into()),
                    label: constants::PERSISTENT_LABEL.into(),
                }),
                oem: Some(PartitionSpec {
                    mount_point: Some(constants::OEM_MOUNT_POINT.into()),
                    label: constants::OEM_LABEL.into(),
                }),
                efi: Some(PartitionSpec {
                    mount_point: Some(constants::EFI_MOUNT_POINT.into()),
                    label: constants::EFI_LABEL.into(),
                }),
            },
            active: ImageSpec {
                source: ImageSource::None,
                file: state_mount.join(constants::ACTIVE_IMG_FILE),
                mount_point: constants::TRANSITION_MOUNT_POINT.into(),
                label: constants::ACTIVE_IMG_LABEL.into(),
                fs: FileSystem::Ext4,
                size_mib: constants::DEFAULT_IMAGE_SIZE_MIB,
            },
            passive: ImageSpec {
                source: ImageSource::None,
                file: state_mount.join(constants::PASSIVE_IMG_FILE),
                mount_point: constants::TRANSITION_MOUNT_POINT.into(),
                label: constants::PASSIVE_IMG_LABEL.into(),
                fs: FileSystem::Ext4,
                size_mib: constants::DEFAULT_IMAGE_SIZE_MIB,
            },
            recovery: ImageSpec {
                source: ImageSource::None,
                file: recovery_mount.join(constants::RECOVERY_IMG_FILE),
                mount_point: constants::TRANSITION_MOUNT_POINT.into(),
                label: constants::RECOVERY_IMG_LABEL.into(),
                fs: FileSystem::Ext4,
                size_mib: constants::DEFAULT_IMAGE_SIZE_MIB,
            },
            no_format: false,
            force: false,
            eject_cd: false,
            format_persistent: false,
            format_oem: false,
            reboot: false,
            poweroff: false,
            strict_hooks: false,
            cloud_init: Vec::new(),
            extra_dirs: Vec::new(),
            bind_mounts: BTreeMap::new(),
            hooks: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    /// Loads the configuration document, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self, KeelError> {
        if !path.exists() {
            log::debug!(
                "No agent configuration at '{}', using defaults",
                path.display()
            );
            return Ok(AgentConfig::default());
        }
        let contents = std::fs::read_to_string(path).structured(InitializationError::LoadConfig {
            path: path.display().to_string(),
        })?;
        let mut config: AgentConfig =
            serde_yaml::from_str(&contents).structured(InitializationError::ParseConfig)?;
        config.normalize();
        Ok(config)
    }

    /// Fills in slot defaults for image fields a partial document left empty,
    /// so overriding only `source:` keeps the well-known file locations.
    pub fn normalize(&mut self) {
        let defaults = AgentConfig::default();
        for (slot, default) in [
            (&mut self.active, &defaults.active),
            (&mut self.passive, &defaults.passive),
            (&mut self.recovery, &defaults.recovery),
        ] {
            if slot.file.as_os_str().is_empty() {
                slot.file = default.file.clone();
            }
            if slot.mount_point.as_os_str().is_empty() {
                slot.mount_point = default.mount_point.clone();
            }
            if slot.label.is_empty() {
                slot.label = default.label.clone();
            }
            if slot.size_mib == 0 {
                slot.size_mib = default.size_mib;
            }
        }
    }

    pub fn install_spec(&self) -> InstallSpec {
        InstallSpec {
            target: self.device.clone(),
            iso: self.iso.clone(),
            active: self.active.clone(),
            passive: self.passive.clone(),
            recovery: self.recovery.clone(),
            partitions: self.partitions.clone(),
            no_format: self.no_format,
            force: self.force,
            eject_cd: self.eject_cd,
            cloud_init: self.cloud_init.clone(),
            extra_dirs: self.extra_dirs.clone(),
            bind_mounts: self.bind_mounts.clone(),
            strict_hooks: self.strict_hooks,
        }
    }

    pub fn upgrade_spec(&self, recovery_upgrade: bool) -> UpgradeSpec {
        UpgradeSpec {
            recovery_upgrade,
            active: self.active.clone(),
            passive: self.passive.clone(),
            recovery: self.recovery.clone(),
            partitions: self.partitions.clone(),
            extra_dirs: self.extra_dirs.clone(),
            bind_mounts: self.bind_mounts.clone(),
            strict_hooks: self.strict_hooks,
        }
    }

    pub fn reset_spec(&self) -> ResetSpec {
        ResetSpec {
            active: self.active.clone(),
            passive: self.passive.clone(),
            partitions: self.partitions.clone(),
            format_persistent: self.format_persistent,
            format_oem: self.format_oem,
            reboot: self.reboot,
            poweroff: self.poweroff,
            extra_dirs: self.extra_dirs.clone(),
            bind_mounts: self.bind_mounts.clone(),
            strict_hooks: self.strict_hooks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_source_roundtrip() {
        for (uri, parsed) in [
            ("file:///tmp/x.img", ImageSource::File("/tmp/x.img".into())),
            ("dir:///srv/rootfs", ImageSource::Dir("/srv/rootfs".into())),
            (
                "oci://ghcr.io/acme/os:v2",
                ImageSource::Oci("ghcr.io/acme/os:v2".into()),
            ),
        ] {
            let source: ImageSource = uri.parse().unwrap();
            assert_eq!(source, parsed);
            assert_eq!(source.to_string(), uri);
        }

        assert_eq!("".parse::<ImageSource>().unwrap(), ImageSource::None);
        assert_eq!(
            "docker://quay.io/acme/os".parse::<ImageSource>().unwrap(),
            ImageSource::Oci("quay.io/acme/os".into())
        );
        assert_eq!(
            "/srv/plain.img".parse::<ImageSource>().unwrap(),
            ImageSource::File("/srv/plain.img".into())
        );
        assert!("ftp://nope".parse::<ImageSource>().is_err());
    }

    #[test]
    fn test_default_config_shape() {
        let config = AgentConfig::default();
        assert_eq!(
            config.active.file,
            PathBuf::from("/run/keel/state/images/active.img")
        );
        assert_eq!(config.partitions.configured().len(), 5);
        assert_eq!(
            config.partitions.get(PartitionRole::Oem).unwrap().label,
            "COS_OEM"
        );
    }

    #[test]
    fn test_config_parse_overrides() {
        let doc = indoc::indoc! {"
            device: /dev/vda
            no_format: true
            active:
              source: oci://ghcr.io/acme/os:v3
              fs: ext4
            hooks:
              before-install:
                - echo hello
        "};
        let config: AgentConfig = serde_yaml::from_str(doc).unwrap();
        assert_eq!(config.device, Some(PathBuf::from("/dev/vda")));
        assert!(config.no_format);
        assert_eq!(
            config.active.source,
            ImageSource::Oci("ghcr.io/acme/os:v3".into())
        );
        assert_eq!(config.hooks["before-install"], vec!["echo hello"]);
    }

    #[test]
    fn test_extension_role_gating() {
        assert!(ExtensionRole::Common.matches_boot(BootRole::Recovery));
        assert!(ExtensionRole::Active.matches_boot(BootRole::Active));
        assert!(!ExtensionRole::Active.matches_boot(BootRole::Passive));
        assert!(!ExtensionRole::Passive.matches_boot(BootRole::Unknown));
    }
}
