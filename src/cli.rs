//! Interactive CLI menu for the file converter
//! Uses dialoguer for user interaction

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::{AppConfig, ConfigError};
use crate::context::{ContextKey, ContextTemplate};
use crate::conversion::ConverterRegistry;
use crate::dispatch::{display_source, DispatchError, DispatchPool, JobReport, JobStatus, PoolSettings};
use crate::engine::ConversionEngine;
use crate::watcher::{DirectoryWatcher, WatchError, WatchOutcome, WatchResult, WatchSummary, WatcherHandle};

/// How many finished jobs a watch session keeps for its closing summary
const RECENT_REPORTS: usize = 10;

// Custom error type for CLI operations
#[derive(Debug)]
pub enum CliError {
    Io(io::Error),
    Config(ConfigError),
    Dialoguer(dialoguer::Error),
    Dispatch(DispatchError),
    Watch(WatchError),
    Thread(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Io(e) => write!(f, "IO error: {}", e),
            CliError::Config(e) => write!(f, "Config error: {}", e),
            CliError::Dialoguer(e) => write!(f, "UI interaction error: {}", e),
            CliError::Dispatch(e) => write!(f, "Dispatch error: {}", e),
            CliError::Watch(e) => write!(f, "Watch error: {}", e),
            CliError::Thread(name) => write!(f, "Thread {} panicked", name),
        }
    }
}

impl StdError for CliError {}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        CliError::Io(err)
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Config(err)
    }
}

impl From<dialoguer::Error> for CliError {
    fn from(err: dialoguer::Error) -> Self {
        CliError::Dialoguer(err)
    }
}

impl From<DispatchError> for CliError {
    fn from(err: DispatchError) -> Self {
        CliError::Dispatch(err)
    }
}

impl From<WatchError> for CliError {
    fn from(err: WatchError) -> Self {
        CliError::Watch(err)
    }
}

// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// A running watcher, its worker pool and a thread echoing job reports
pub struct WatchSession {
    handle: WatcherHandle,
    watcher: JoinHandle<WatchResult<WatchOutcome>>,
    monitor: JoinHandle<()>,
    recent: Arc<Mutex<VecDeque<JobReport>>>,
}

impl WatchSession {
    /// Build the engine, pool and watcher for `root` and start watching.
    pub fn start(root: &Path, config: &AppConfig, registry: Arc<ConverterRegistry>) -> CliResult<Self> {
        let template = Arc::new(ContextTemplate::new(config.context.clone()));
        let engine = Arc::new(ConversionEngine::from_config(registry, config));
        let pool = DispatchPool::new(PoolSettings::from_config(config), engine, template.clone())?;
        let reports = pool.reports();

        let watcher = DirectoryWatcher::new(root, pool, template)?;
        let (handle, watcher) = watcher.spawn()?;

        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_REPORTS)));
        let sink = recent.clone();
        let monitor = thread::Builder::new()
            .name("report-monitor".to_string())
            .spawn(move || {
                // Ends once every worker has exited
                for report in reports.iter() {
                    print_report(&report);
                    let mut recent = sink.lock();
                    if recent.len() == RECENT_REPORTS {
                        recent.pop_front();
                    }
                    recent.push_back(report);
                }
            })?;

        Ok(Self {
            handle,
            watcher,
            monitor,
            recent,
        })
    }

    /// Interrupt the watcher, then wait for queued jobs to finish.
    pub fn stop(self) -> CliResult<WatchSummary> {
        self.handle.shutdown();
        self.wait()
    }

    /// Wait for the watcher to stop on its own (root deleted or watch service failure).
    pub fn wait(self) -> CliResult<WatchSummary> {
        let outcome = self
            .watcher
            .join()
            .map_err(|_| CliError::Thread("dir-watcher".to_string()))??;
        outcome.pool.join();
        self.monitor
            .join()
            .map_err(|_| CliError::Thread("report-monitor".to_string()))?;
        Ok(outcome.summary)
    }

    pub fn recent_reports(&self) -> Vec<JobReport> {
        self.recent.lock().iter().cloned().collect()
    }
}

fn print_report(report: &JobReport) {
    let source = display_source(&report.source);
    match &report.status {
        JobStatus::Completed(outputs) => {
            let names: Vec<String> = outputs.iter().map(|p| display_source(p)).collect();
            println!("{} {} -> {}", style("converted").green(), source, names.join(", "));
        }
        JobStatus::Failed(reason) => println!("{} {}: {}", style("failed").red().bold(), source, reason),
        JobStatus::Rejected(reason) => println!("{} {}: {}", style("rejected").yellow(), source, reason),
    }
}

fn print_summary(summary: &WatchSummary) {
    println!("\n{}", style("Watch summary").cyan().bold());
    println!("  Events seen:           {}", summary.events_seen);
    println!("  Jobs dispatched:       {}", summary.jobs_dispatched);
    println!("  Jobs rejected:         {}", summary.jobs_rejected);
    println!("  Overflows:             {}", summary.overflows);
    println!("  Directories watched:   {}", summary.directories_registered);
    println!("  Still registered:      {}", summary.directories_remaining);
}

/// Main menu options
#[derive(Debug, Clone, Copy)]
pub enum MainMenuOption {
    WatchFolder,
    ConvertFile,
    ListConversions,
    EditContext,
    SaveConfig,
    Exit,
}

impl MainMenuOption {
    /// Get all menu options
    pub fn variants() -> &'static [MainMenuOption] {
        &[
            MainMenuOption::WatchFolder,
            MainMenuOption::ConvertFile,
            MainMenuOption::ListConversions,
            MainMenuOption::EditContext,
            MainMenuOption::SaveConfig,
            MainMenuOption::Exit,
        ]
    }

    /// Get the display name for the menu option
    pub fn display_name(&self) -> &'static str {
        match self {
            MainMenuOption::WatchFolder => "Watch monitored folder",
            MainMenuOption::ConvertFile => "Convert a file",
            MainMenuOption::ListConversions => "List possible conversions",
            MainMenuOption::EditContext => "Edit conversion defaults",
            MainMenuOption::SaveConfig => "Save config",
            MainMenuOption::Exit => "Exit",
        }
    }
}

/// CLI manager for interactive menus
pub struct CliManager {
    config: AppConfig,
    config_path: PathBuf,
    registry: Arc<ConverterRegistry>,
    theme: ColorfulTheme,
}

impl CliManager {
    pub fn new(config: AppConfig, config_path: impl Into<PathBuf>, registry: Arc<ConverterRegistry>) -> Self {
        Self {
            config,
            config_path: config_path.into(),
            registry,
            theme: ColorfulTheme::default(),
        }
    }

    /// Check if we're running in an interactive terminal
    pub fn is_interactive_terminal() -> bool {
        io::stdin().is_terminal() && io::stdout().is_terminal()
    }

    /// Run the main menu loop
    pub fn run(&mut self) -> CliResult<()> {
        loop {
            match self.show_main_menu()? {
                MainMenuOption::WatchFolder => self.watch_folder()?,
                MainMenuOption::ConvertFile => self.convert_file()?,
                MainMenuOption::ListConversions => self.list_conversions()?,
                MainMenuOption::EditContext => self.edit_context()?,
                MainMenuOption::SaveConfig => self.save_config()?,
                MainMenuOption::Exit => {
                    println!("{}", style("Exiting...").cyan());
                    break;
                }
            }
        }
        Ok(())
    }

    fn show_main_menu(&self) -> CliResult<MainMenuOption> {
        let options = MainMenuOption::variants();
        let option_names: Vec<&str> = options.iter().map(|o| o.display_name()).collect();

        println!("\n{}", style("File Converter - Main Menu").cyan().bold());

        let selection = Select::with_theme(&self.theme)
            .items(&option_names)
            .default(0)
            .interact()?;

        Ok(options[selection])
    }

    fn watch_folder(&mut self) -> CliResult<()> {
        println!("\n{}", style("Watch Monitored Folder").cyan().bold());

        let root = match &self.config.monitored_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir: String = Input::with_theme(&self.theme)
                    .with_prompt("Folder to watch")
                    .interact_text()?;
                let dir = PathBuf::from(dir.trim());
                self.config.monitored_dir = Some(dir.clone());
                dir
            }
        };

        if let Err(e) = self.config.validate() {
            println!("{}: {}", style("Invalid configuration").red().bold(), e);
            self.press_enter_to_continue()?;
            return Ok(());
        }

        let session = match WatchSession::start(&root, &self.config, self.registry.clone()) {
            Ok(session) => session,
            Err(e) => {
                println!("{}: {}", style("Could not start watching").red().bold(), e);
                self.press_enter_to_continue()?;
                return Ok(());
            }
        };

        println!(
            "Watching {} (new files go to {})",
            style(root.display()).green(),
            style(self.config.output_dir.display()).green()
        );
        println!("Press Enter to stop watching...");
        let mut buffer = String::new();
        io::stdin().read_line(&mut buffer)?;

        let summary = session.stop()?;
        print_summary(&summary);
        self.press_enter_to_continue()?;
        Ok(())
    }

    fn convert_file(&self) -> CliResult<()> {
        println!("\n{}", style("Convert a File").cyan().bold());

        let path: String = Input::with_theme(&self.theme)
            .with_prompt("File to convert")
            .interact_text()?;
        let path = PathBuf::from(path.trim());
        if !path.is_file() {
            println!("{}: {}", style("No such file").red().bold(), path.display());
            self.press_enter_to_continue()?;
            return Ok(());
        }

        let mut ctx = self.config.context.clone();
        let current = ctx.destination_format().unwrap_or("").to_string();
        let format: String = Input::with_theme(&self.theme)
            .with_prompt("Target format")
            .default(current)
            .interact_text()?;
        if let Err(e) = ctx.set(ContextKey::DestinationFormat, Value::String(format.trim().to_string())) {
            println!("{}: {}", style("Error").red().bold(), e);
            self.press_enter_to_continue()?;
            return Ok(());
        }

        let engine = ConversionEngine::from_config(self.registry.clone(), &self.config);
        match engine.convert_file(&path, ctx) {
            Ok(outputs) => {
                println!("{}", style("Conversion complete!").green());
                for output in outputs {
                    println!("  {}", output.display());
                }
            }
            Err(e) => println!("{}: {}", style("Conversion failed").red().bold(), e),
        }

        self.press_enter_to_continue()?;
        Ok(())
    }

    fn list_conversions(&self) -> CliResult<()> {
        println!("\n{}", style("Possible Conversions").cyan().bold());

        let source: String = Input::with_theme(&self.theme)
            .with_prompt("Source format or extension")
            .interact_text()?;
        let targets = self.registry.possible_conversions(&source);
        if targets.is_empty() {
            println!("{}", style("No conversions registered for that format.").yellow());
        } else {
            println!("{} -> {}", source.trim(), targets.join(", "));
        }

        self.press_enter_to_continue()?;
        Ok(())
    }

    fn edit_context(&mut self) -> CliResult<()> {
        loop {
            println!("\n{}", style("Conversion Defaults").cyan().bold());
            let mut items: Vec<String> = ContextKey::ALL
                .iter()
                .map(|key| {
                    let value = self.config.context.get(*key).unwrap_or(Value::Null);
                    format!("{:<18} {}", key.as_str(), value)
                })
                .collect();
            items.push("Back to main menu".to_string());

            let selection = Select::with_theme(&self.theme)
                .items(&items)
                .default(0)
                .interact()?;
            let Some(key) = ContextKey::ALL.get(selection).copied() else {
                return Ok(());
            };

            let value = match key {
                ContextKey::Union | ContextKey::ZippedOutput | ContextKey::Protected => {
                    let current = self.config.context.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
                    Value::Bool(
                        Confirm::with_theme(&self.theme)
                            .with_prompt(format!("Enable {}?", key))
                            .default(current)
                            .interact()?,
                    )
                }
                _ => {
                    let text: String = Input::with_theme(&self.theme)
                        .with_prompt(format!("{} (empty clears it)", key))
                        .allow_empty(true)
                        .interact_text()?;
                    match text.trim() {
                        "" => Value::Null,
                        text => Value::String(text.to_string()),
                    }
                }
            };

            match self.config.context.set(key, value) {
                Ok(()) => println!("{}", style("Updated.").green()),
                Err(e) => println!("{}: {}", style("Error").red().bold(), e),
            }
        }
    }

    fn save_config(&self) -> CliResult<()> {
        match self.config.validate().and_then(|_| self.config.save(&self.config_path)) {
            Ok(()) => println!("{} {}", style("Saved").green(), self.config_path.display()),
            Err(e) => println!("{}: {}", style("Error saving config").red().bold(), e),
        }
        self.press_enter_to_continue()?;
        Ok(())
    }

    fn press_enter_to_continue(&self) -> CliResult<()> {
        println!("\nPress Enter to continue...");
        let mut buffer = String::new();
        io::stdin().read_line(&mut buffer)?;
        Ok(())
    }
}

/// Run the CLI
pub fn run_cli(config: AppConfig, config_path: impl Into<PathBuf>, registry: Arc<ConverterRegistry>) -> Result<()> {
    let mut cli_manager = CliManager::new(config, config_path, registry);
    cli_manager.run()?;
    Ok(())
}
