//! Resolution of configuration into a concrete [`HostProcess`].
//!
//! Per-run isolation properties take precedence over the persisted
//! [`Preferences`]:
//!
//! | Input | Result |
//! |-------|--------|
//! | `AcadAttachToExisting = "true"` | attach to the running instance |
//! | non-empty `AcadExePath` | launch that executable |
//! | neither | the preference's [`StartupAction`] |
//!
//! A preference of `attach_to_existing` is overridden to "start most recently
//! used" when the run explicitly sets `AcadAttachToExisting = "false"`.
//!
//! Launching validates the executable and working directory up front so
//! configuration mistakes surface before any process is spawned.

pub mod recent;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{Preferences, StartupAction, expand_path};
use crate::diagnostics::ErrorSink;
use crate::process::{
    CreatedProcess, ExistingProcess, HostProcess, HostSettings, ProcessError, ProcessResult,
    ProcessServices,
};

pub use recent::RecentExecutables;

/// Property requesting attachment to a running host (`"true"`/`"false"`).
pub const ATTACH_TO_EXISTING_PROPERTY: &str = "AcadAttachToExisting";

/// Property naming the host executable to launch.
pub const EXE_PATH_PROPERTY: &str = "AcadExePath";

/// String-keyed override properties for one test run.
///
/// # Example
///
/// ```
/// use hostdrive::factory::IsolationOptions;
///
/// let mut options = IsolationOptions::new();
/// options.add_property("AcadAttachToExisting", "true");
/// assert_eq!(options.property("AcadAttachToExisting"), Some("true"));
///
/// let (key, value) = IsolationOptions::parse_property("AcadExePath=/opt/acad").unwrap();
/// assert_eq!((key.as_str(), value.as_str()), ("AcadExePath", "/opt/acad"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolationOptions {
    properties: BTreeMap<String, String>,
}

impl IsolationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut options = Self::new();
        for (key, value) in pairs {
            options.add_property(key, value);
        }
        options
    }

    /// Sets a property, replacing any previous value.
    pub fn add_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parses a `KEY=VALUE` string. The value may be empty.
    pub fn parse_property(s: &str) -> ProcessResult<(String, String)> {
        let (key, value) = s.split_once('=').ok_or_else(|| {
            ProcessError::InvalidArgument(format!("Expected KEY=VALUE, got '{}'", s))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ProcessError::InvalidArgument(format!(
                "Empty property name in '{}'",
                s
            )));
        }
        Ok((key.to_string(), value.to_string()))
    }
}

/// File system probe used to validate paths.
pub trait FileSystem: Send + Sync {
    fn file_exists(&self, path: &Path) -> bool;
    fn directory_exists(&self, path: &Path) -> bool;
}

/// The real file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// Knows which host executable was used most recently.
pub trait ExecutableLocator: Send + Sync {
    fn most_recently_used(&self) -> Option<PathBuf>;
}

/// Persisted preferences consulted when no override is given.
pub trait PreferenceStore: Send + Sync {
    fn startup_action(&self) -> StartupAction;
    fn user_specified_executable(&self) -> Option<PathBuf>;
    fn command_line_arguments(&self) -> Option<String>;
    fn working_directory(&self) -> Option<PathBuf>;
}

impl PreferenceStore for Preferences {
    fn startup_action(&self) -> StartupAction {
        self.startup_action
    }

    fn user_specified_executable(&self) -> Option<PathBuf> {
        non_blank(self.user_specified_executable.as_deref()).map(expand_path)
    }

    fn command_line_arguments(&self) -> Option<String> {
        non_blank(self.command_line_arguments.as_deref()).map(str::to_string)
    }

    fn working_directory(&self) -> Option<PathBuf> {
        non_blank(self.working_directory.as_deref()).map(expand_path)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Decides how to obtain the host.
///
/// `attach` is the parsed `AcadAttachToExisting` property, if given.
pub fn resolve_startup_action(
    attach: Option<bool>,
    has_exe_override: bool,
    preference: StartupAction,
) -> StartupAction {
    if attach == Some(true) {
        return StartupAction::AttachToExisting;
    }
    if has_exe_override {
        return StartupAction::StartUserSpecified;
    }
    if preference == StartupAction::AttachToExisting && attach == Some(false) {
        return StartupAction::StartMostRecentlyUsed;
    }
    preference
}

/// Returns `true` if `path` contains characters no valid path may hold.
pub fn has_invalid_path_chars(path: &Path) -> bool {
    path.to_string_lossy()
        .chars()
        .any(|c| matches!(c, '"' | '<' | '>' | '|') || c.is_control())
}

fn parse_attach_property(options: &IsolationOptions) -> ProcessResult<Option<bool>> {
    let Some(raw) = options.property(ATTACH_TO_EXISTING_PROPERTY) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(Some(true)),
        "false" => Ok(Some(false)),
        _ => Err(ProcessError::InvalidArgument(format!(
            "{} must be 'true' or 'false', got '{}'",
            ATTACH_TO_EXISTING_PROPERTY, raw
        ))),
    }
}

/// Builds host processes from isolation options and preferences.
pub struct ProcessFactory {
    process_name: String,
    settings: HostSettings,
    services: ProcessServices,
    preferences: Arc<dyn PreferenceStore>,
    locator: Arc<dyn ExecutableLocator>,
    file_system: Arc<dyn FileSystem>,
}

impl ProcessFactory {
    pub fn new(
        process_name: impl Into<String>,
        settings: HostSettings,
        services: ProcessServices,
        preferences: Arc<dyn PreferenceStore>,
        locator: Arc<dyn ExecutableLocator>,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            settings,
            services,
            preferences,
            locator,
            file_system: Arc::new(LocalFileSystem),
        }
    }

    /// Replaces the file system probe.
    pub fn with_file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = file_system;
        self
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Sink shared with the processes this factory builds.
    pub fn sink(&self) -> Arc<dyn ErrorSink> {
        self.services.sink.clone()
    }

    /// Resolves `options` against the preferences and builds the process.
    ///
    /// The process is not started.
    pub fn create_process(&self, options: &IsolationOptions) -> ProcessResult<HostProcess> {
        let attach = parse_attach_property(options)?;
        let exe_override = non_blank(options.property(EXE_PATH_PROPERTY));

        let action = resolve_startup_action(
            attach,
            exe_override.is_some(),
            self.preferences.startup_action(),
        );
        debug!("Resolved startup action: {:?}", action);

        match action {
            StartupAction::AttachToExisting => self.attach(),
            _ => self.create(action, exe_override.map(PathBuf::from)),
        }
    }

    fn attach(&self) -> ProcessResult<HostProcess> {
        let mut processes = self.services.finder.processes_by_name(&self.process_name)?;

        match processes.len() {
            0 => Err(ProcessError::InvalidOperation(format!(
                "No running '{}' process to attach to",
                self.process_name
            ))),
            1 => {
                let handle = processes.remove(0);
                info!("Attaching to '{}' (pid {})", self.process_name, handle.id());
                Ok(HostProcess::Existing(ExistingProcess::new(
                    handle,
                    self.settings.clone(),
                    &self.services,
                )))
            }
            n => Err(ProcessError::NotSupported(format!(
                "Found {} running '{}' processes; attaching requires exactly one",
                n, self.process_name
            ))),
        }
    }

    fn create(
        &self,
        action: StartupAction,
        exe_override: Option<PathBuf>,
    ) -> ProcessResult<HostProcess> {
        let file_name = match exe_override {
            Some(path) => Some(path),
            None if action == StartupAction::StartUserSpecified => {
                self.preferences.user_specified_executable()
            }
            None => self.locator.most_recently_used(),
        };
        let file_name = self.validate_executable(file_name)?;
        let working_directory =
            self.validate_working_directory(self.preferences.working_directory())?;
        let arguments = self.preferences.command_line_arguments();

        let running = self.services.finder.processes_by_name(&self.process_name)?;
        if !running.is_empty() {
            return Err(ProcessError::NotSupported(format!(
                "'{}' is already running; attach to it or close it first",
                self.process_name
            )));
        }

        info!("Will launch host executable {}", file_name.display());
        Ok(HostProcess::Created(
            CreatedProcess::new(file_name, self.settings.clone(), &self.services)
                .with_arguments(arguments)
                .with_working_directory(working_directory),
        ))
    }

    fn validate_executable(&self, file_name: Option<PathBuf>) -> ProcessResult<PathBuf> {
        let Some(file_name) = file_name.filter(|p| !p.as_os_str().is_empty()) else {
            return Err(ProcessError::InvalidArgument(
                "No host executable was specified and none was used recently".to_string(),
            ));
        };
        if has_invalid_path_chars(&file_name) {
            return Err(ProcessError::InvalidArgument(format!(
                "Host executable path contains invalid characters: {}",
                file_name.display()
            )));
        }
        if !self.file_system.file_exists(&file_name) {
            return Err(ProcessError::FileNotFound(file_name.display().to_string()));
        }
        Ok(file_name)
    }

    fn validate_working_directory(&self, dir: Option<PathBuf>) -> ProcessResult<Option<PathBuf>> {
        let Some(dir) = dir.filter(|d| !d.as_os_str().is_empty()) else {
            return Ok(None);
        };
        if has_invalid_path_chars(&dir) {
            return Err(ProcessError::InvalidArgument(format!(
                "Working directory contains invalid characters: {}",
                dir.display()
            )));
        }
        if !self.file_system.directory_exists(&dir) {
            return Err(ProcessError::DirectoryNotFound(dir.display().to_string()));
        }
        Ok(Some(dir))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::diagnostics::default_sink;
    use crate::process::testing::{FakeCreator, FakeFinder, FakeProcess, FakeRunner, settings};

    struct FakeFileSystem {
        files: HashSet<PathBuf>,
        dirs: HashSet<PathBuf>,
    }

    impl FileSystem for FakeFileSystem {
        fn file_exists(&self, path: &Path) -> bool {
            self.files.contains(path)
        }

        fn directory_exists(&self, path: &Path) -> bool {
            self.dirs.contains(path)
        }
    }

    struct FixedLocator(Option<PathBuf>);

    impl ExecutableLocator for FixedLocator {
        fn most_recently_used(&self) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    const RECENT: &str = "/opt/acad/recent/acad";
    const USER: &str = "/opt/acad/user/acad";
    const OVERRIDE: &str = "/opt/acad/override/acad";

    fn factory(preferences: Preferences, running: Vec<Arc<FakeProcess>>) -> ProcessFactory {
        let services = ProcessServices {
            creator: FakeCreator::new(FakeProcess::new(1)),
            finder: FakeFinder::with(running),
            runner: Arc::new(FakeRunner::default()),
            sink: default_sink(),
        };
        let file_system = FakeFileSystem {
            files: [RECENT, USER, OVERRIDE].into_iter().map(PathBuf::from).collect(),
            dirs: [PathBuf::from("/work")].into_iter().collect(),
        };
        ProcessFactory::new(
            "acad",
            settings(),
            services,
            Arc::new(preferences),
            Arc::new(FixedLocator(Some(PathBuf::from(RECENT)))),
        )
        .with_file_system(Arc::new(file_system))
    }

    fn prefs(action: StartupAction) -> Preferences {
        Preferences {
            startup_action: action,
            user_specified_executable: Some(USER.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_startup_action_table() {
        use StartupAction::*;

        let cases = [
            (Some(true), true, StartUserSpecified, AttachToExisting),
            (None, true, AttachToExisting, StartUserSpecified),
            (Some(false), false, AttachToExisting, StartMostRecentlyUsed),
            (None, false, AttachToExisting, AttachToExisting),
            (Some(false), false, StartUserSpecified, StartUserSpecified),
            (None, false, StartMostRecentlyUsed, StartMostRecentlyUsed),
        ];
        for (attach, has_exe, preference, expected) in cases {
            assert_eq!(
                resolve_startup_action(attach, has_exe, preference),
                expected,
                "attach={:?} exe={} preference={:?}",
                attach,
                has_exe,
                preference
            );
        }
    }

    #[test]
    fn test_attach_property_wins_over_preference() {
        let running = FakeProcess::new(55);
        let factory = factory(prefs(StartupAction::StartUserSpecified), vec![running]);
        let options = IsolationOptions::from_pairs([(ATTACH_TO_EXISTING_PROPERTY, "true")]);

        let process = factory.create_process(&options).unwrap();
        assert!(process.is_existing());
        assert_eq!(process.id(), Some(55));
    }

    #[test]
    fn test_attach_property_case_insensitive() {
        let factory = factory(
            prefs(StartupAction::StartMostRecentlyUsed),
            vec![FakeProcess::new(9)],
        );
        let options = IsolationOptions::from_pairs([(ATTACH_TO_EXISTING_PROPERTY, "TRUE")]);
        assert!(factory.create_process(&options).unwrap().is_existing());
    }

    #[test]
    fn test_exe_override_wins_over_attach_preference() {
        let factory = factory(prefs(StartupAction::AttachToExisting), vec![]);
        let options = IsolationOptions::from_pairs([(EXE_PATH_PROPERTY, OVERRIDE)]);

        let process = factory.create_process(&options).unwrap();
        assert!(process.is_created());
        assert_eq!(process.file_name(), Some(Path::new(OVERRIDE)));
    }

    #[test]
    fn test_unparseable_attach_property() {
        let factory = factory(prefs(StartupAction::StartMostRecentlyUsed), vec![]);
        let options = IsolationOptions::from_pairs([(ATTACH_TO_EXISTING_PROPERTY, "yes")]);

        let err = factory.create_process(&options).err().unwrap();
        assert!(matches!(err, ProcessError::InvalidArgument(_)));
    }

    #[test]
    fn test_attach_false_overrides_attach_preference() {
        let factory = factory(prefs(StartupAction::AttachToExisting), vec![]);
        let options = IsolationOptions::from_pairs([(ATTACH_TO_EXISTING_PROPERTY, "false")]);

        let process = factory.create_process(&options).unwrap();
        assert_eq!(process.file_name(), Some(Path::new(RECENT)));
    }

    #[test]
    fn test_attach_preference_without_running_process() {
        let factory = factory(prefs(StartupAction::AttachToExisting), vec![]);
        let err = factory.create_process(&IsolationOptions::new()).err().unwrap();
        assert!(matches!(err, ProcessError::InvalidOperation(_)));
    }

    #[test]
    fn test_attach_with_several_candidates_not_supported() {
        let factory = factory(
            prefs(StartupAction::AttachToExisting),
            vec![FakeProcess::new(1), FakeProcess::new(2)],
        );
        let err = factory.create_process(&IsolationOptions::new()).err().unwrap();
        assert!(matches!(err, ProcessError::NotSupported(_)));
    }

    #[test]
    fn test_most_recently_used_preference() {
        let factory = factory(prefs(StartupAction::StartMostRecentlyUsed), vec![]);
        let process = factory.create_process(&IsolationOptions::new()).unwrap();
        assert_eq!(process.file_name(), Some(Path::new(RECENT)));
    }

    #[test]
    fn test_user_specified_preference_with_arguments_and_directory() {
        let preferences = Preferences {
            command_line_arguments: Some("/nologo".to_string()),
            working_directory: Some("/work".to_string()),
            ..prefs(StartupAction::StartUserSpecified)
        };
        let factory = factory(preferences, vec![]);

        let process = factory.create_process(&IsolationOptions::new()).unwrap();
        assert_eq!(process.file_name(), Some(Path::new(USER)));
        assert_eq!(process.arguments(), Some("/nologo"));
        assert_eq!(process.working_directory(), Some(Path::new("/work")));
    }

    #[test]
    fn test_blank_arguments_and_directory_mean_none() {
        let preferences = Preferences {
            command_line_arguments: Some("  ".to_string()),
            working_directory: Some(String::new()),
            ..prefs(StartupAction::StartUserSpecified)
        };
        let factory = factory(preferences, vec![]);

        let process = factory.create_process(&IsolationOptions::new()).unwrap();
        assert_eq!(process.arguments(), None);
        assert_eq!(process.working_directory(), None);
    }

    #[test]
    fn test_user_specified_missing_executable() {
        let preferences = Preferences {
            user_specified_executable: None,
            ..prefs(StartupAction::StartUserSpecified)
        };
        let factory = factory(preferences, vec![]);

        let err = factory.create_process(&IsolationOptions::new()).err().unwrap();
        assert!(matches!(err, ProcessError::InvalidArgument(_)));
    }

    #[test]
    fn test_malformed_executable_path() {
        let factory = factory(prefs(StartupAction::StartMostRecentlyUsed), vec![]);
        let options = IsolationOptions::from_pairs([(EXE_PATH_PROPERTY, "/opt/a<b>|c")]);

        let err = factory.create_process(&options).err().unwrap();
        assert!(matches!(err, ProcessError::InvalidArgument(_)));
    }

    #[test]
    fn test_nonexistent_executable() {
        let factory = factory(prefs(StartupAction::StartMostRecentlyUsed), vec![]);
        let options = IsolationOptions::from_pairs([(EXE_PATH_PROPERTY, "/opt/missing/acad")]);

        let err = factory.create_process(&options).err().unwrap();
        assert!(matches!(err, ProcessError::FileNotFound(_)));
    }

    #[test]
    fn test_nonexistent_working_directory() {
        let preferences = Preferences {
            working_directory: Some("/nowhere".to_string()),
            ..prefs(StartupAction::StartUserSpecified)
        };
        let factory = factory(preferences, vec![]);

        let err = factory.create_process(&IsolationOptions::new()).err().unwrap();
        assert!(matches!(err, ProcessError::DirectoryNotFound(_)));
    }

    #[test]
    fn test_malformed_working_directory() {
        let preferences = Preferences {
            working_directory: Some("/work\u{1}dir".to_string()),
            ..prefs(StartupAction::StartUserSpecified)
        };
        let factory = factory(preferences, vec![]);

        let err = factory.create_process(&IsolationOptions::new()).err().unwrap();
        assert!(matches!(err, ProcessError::InvalidArgument(_)));
    }

    #[test]
    fn test_create_when_already_running_not_supported() {
        let factory = factory(
            prefs(StartupAction::StartUserSpecified),
            vec![FakeProcess::new(3)],
        );
        let err = factory.create_process(&IsolationOptions::new()).err().unwrap();
        assert!(matches!(err, ProcessError::NotSupported(_)));
    }

    #[test]
    fn test_parse_property() {
        assert_eq!(
            IsolationOptions::parse_property("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(
            IsolationOptions::parse_property("A=").unwrap(),
            ("A".to_string(), String::new())
        );
        assert!(IsolationOptions::parse_property("novalue").is_err());
        assert!(IsolationOptions::parse_property("=x").is_err());
    }

    #[test]
    fn test_has_invalid_path_chars() {
        assert!(!has_invalid_path_chars(Path::new("/opt/Autodesk/AutoCAD 2024/acad")));
        assert!(has_invalid_path_chars(Path::new("/opt/\"quoted\"")));
        assert!(has_invalid_path_chars(Path::new("/opt/tab\there")));
    }
}
