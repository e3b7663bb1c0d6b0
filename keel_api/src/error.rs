use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// The agent failed before any servicing started.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InitializationError {
    #[error("Failed to load agent configuration from '{path}'")]
    LoadConfig { path: String },
    #[error("Failed to parse agent configuration")]
    ParseConfig,
    #[error("Failed to detect the currently booted image slot")]
    DetectBootRole,
}

/// User provided input was invalid.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("No target device configured and no candidate disk was detected")]
    NoTargetDevice,
    #[error("use force flag to run an installation over the current running deployment")]
    ForceRequired,
    #[error("Unsupported source scheme '{scheme}'")]
    UnsupportedScheme { scheme: String },
    #[error("'{name}' is not a .raw system extension image")]
    NotAnExtension { name: String },
}

/// Some step of an install, upgrade or reset pipeline failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ServicingError {
    #[error("Failed to inspect existing deployments")]
    DetectDeployment,
    #[error("Failed to partition and format the target device")]
    PartitionDevice,
    #[error("Failed to format partition labeled '{label}'")]
    FormatPartition { label: String },
    #[error("Failed to mount partition labeled '{label}'")]
    MountPartition { label: String },
    #[error("Failed to unmount '{path}'")]
    Unmount { path: String },
    #[error("Failed to deploy image '{label}'")]
    DeployImage { label: String },
    #[error("Failed to unmount image '{label}'")]
    UnmountImage { label: String },
    #[error("Failed to fetch installation medium")]
    FetchIso,
    #[error("Failed to copy cloud configs into the new root")]
    CopyCloudConfig,
    #[error("Failed to install the bootloader")]
    InstallBootloader,
    #[error("Failed to relabel the deployed filesystem")]
    Relabel,
    #[error("Hook '{stage}' failed")]
    Hook { stage: String },
    #[error("Failed to back up the active image to the passive slot")]
    BackupActive,
    #[error("Failed to relabel the passive image")]
    LabelPassive,
    #[error("Failed to move the transition image into place")]
    FinalizeUpgrade,
    #[error("Failed to flush filesystem buffers")]
    Sync,
    #[error("undefined state or recovery partition")]
    UndefinedStateOrRecovery,
    #[error("Failed to reboot or power off")]
    Shutdown,
    #[error("Failed to write the install state file")]
    WriteState,
    #[error("Failed to read the install state file")]
    ReadState,
    #[error("Cleanup failed after servicing")]
    Cleanup,
}

/// Boot-entry listing or selection failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BootEntryError {
    #[error("Failed to list boot entries")]
    ListEntries,
    #[error("entry {entry} does not exist")]
    NotFound { entry: String },
    #[error("No boot entry mapping for '{value}'")]
    UnmappedName { value: String },
    #[error("Loader configuration missing at '{path}'")]
    MissingLoaderConf { path: String },
    #[error("Failed to update the loader configuration")]
    WriteLoaderConf,
    #[error("Failed to remount the boot filesystem")]
    RemountBoot,
    #[error("Failed to write the GRUB environment block")]
    WriteGrubEnv,
    #[error("Failed to rotate boot artifacts from '{from}' to '{to}'")]
    RotateRole { from: String, to: String },
    #[error("Failed to assign sort keys to boot entries")]
    AssignSortKeys,
}

/// System-extension management failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionError {
    #[error("Failed to download extension from '{uri}'")]
    Download { uri: String },
    #[error("No installed extension matches '{name}'")]
    NotFound { name: String },
    #[error("Invalid extension pattern '{pattern}'")]
    InvalidPattern { pattern: String },
    #[error("Failed to create extension directory '{path}'")]
    CreateDir { path: String },
    #[error("Failed to link extension '{name}'")]
    Link { name: String },
    #[error("Failed to unlink extension '{name}'")]
    Unlink { name: String },
    #[error("Failed to list extensions")]
    List,
    #[error("Failed to restart the system extension service")]
    ServiceRestart,
}

/// An uncategorized error occurred or a bug was encountered.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
/// The categories are intended to be user-meaningful: they separate bad input
/// from servicing failures from bugs in the agent itself.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(transparent)]
    Servicing(#[from] ServicingError),

    #[error(transparent)]
    BootEntry(#[from] BootEntryError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct KeelErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct KeelError(Box<KeelErrorInner>);
impl KeelError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        KeelError(Box::new(KeelErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        KeelError(Box::new(KeelErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(message: &'static str) -> Self {
        Self::new(InternalError::Internal(message))
    }

    /// Records a secondary failure caught while this error was already being
    /// handled, without masking the original kind.
    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: KeelError) -> Self {
        self.0.context.push((
            format!(
                "While handling the error, an additional error was caught: \
                 \n\n{secondary:?}\n\nThe earlier error:"
            )
            .into(),
            Location::caller(),
        ));
        self
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured KeelError.
    fn structured(self, kind: K) -> Result<T, KeelError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, KeelError> {
        match self {
            Some(t) => Ok(t),
            None => Err(KeelError(Box::new(KeelErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, KeelError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(KeelError(Box::new(KeelErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait KeelResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, KeelError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}
impl<T> KeelResultExt<T> for Result<T, KeelError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, KeelError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for KeelError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("keel-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Initialization(ref e) => state.serialize_field("error", e)?,
            ErrorKind::InvalidInput(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Servicing(ref e) => state.serialize_field("error", e)?,
            ErrorKind::BootEntry(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Extension(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for KeelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}
