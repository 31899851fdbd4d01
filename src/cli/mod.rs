//! Command-line interface

mod handlers;

use crate::config;
use crate::error::{BuildError, Result};
use crate::narrower::{TargetProfile, Transform};
use crate::BuildOptions;
use clap::{Arg, ArgAction, ArgMatches, Command, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Profile {
    Hermes,
    Es5,
    Es2018,
    Esnext,
}

impl From<Profile> for TargetProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Hermes => TargetProfile::Hermes,
            Profile::Es5 => TargetProfile::Es5,
            Profile::Es2018 => TargetProfile::Es2018,
            Profile::Esnext => TargetProfile::Esnext,
        }
    }
}

pub struct EnhancedCli {
    root: PathBuf,
    config_path: Option<PathBuf>,
    start_time: Instant,
}

impl Default for EnhancedCli {
    fn default() -> Self {
        Self::new()
    }
}

impl EnhancedCli {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("."),
            config_path: None,
            start_time: Instant::now(),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        self.start_time = Instant::now();
        let matches = self.build_cli().get_matches();

        self.setup_logging(matches.get_count("verbose"))?;

        if let Some(root) = matches.get_one::<PathBuf>("root") {
            self.root = root.clone();
        }
        self.config_path = matches.get_one::<PathBuf>("config").cloned();

        match matches.subcommand() {
            Some(("build", sub_matches)) => handlers::handle_build_command(self, sub_matches),
            Some(("bundle", sub_matches)) => handlers::handle_bundle_command(self, sub_matches),
            Some(("check", sub_matches)) => handlers::handle_check_command(self, sub_matches),
            Some(("platform", sub_matches)) => handlers::handle_platform_command(self, sub_matches),
            Some(("transforms", sub_matches)) => {
                handlers::handle_transforms_command(self, sub_matches)
            }
            Some(("init", sub_matches)) => handlers::handle_init_command(self, sub_matches),
            _ => {
                println!("No subcommand specified. Use --help for usage information.");
                Ok(())
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }

    fn build_cli(&self) -> Command {
        let pipeline_args = [
            Arg::new("profile")
                .short('p')
                .long("profile")
                .value_parser(clap::value_parser!(Profile))
                .help("Target profile supplying default transforms"),
            Arg::new("include")
                .short('i')
                .long("include")
                .value_name("TRANSFORM")
                .help("Apply a transform regardless of the profile")
                .action(ArgAction::Append),
            Arg::new("exclude")
                .short('x')
                .long("exclude")
                .value_name("TRANSFORM")
                .help("Never apply a transform (wins over --include)")
                .action(ArgAction::Append),
            Arg::new("define")
                .short('D')
                .long("define")
                .value_name("NAME=VALUE")
                .help("Replace an identifier or dotted chain with source text")
                .action(ArgAction::Append),
            Arg::new("minify")
                .long("minify")
                .help("Strip comments and collapse whitespace in the bundle")
                .action(ArgAction::SetTrue),
            Arg::new("out-dir")
                .short('o')
                .long("out-dir")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Output directory"),
        ];

        Command::new(crate::NAME)
            .version(crate::VERSION)
            .about(crate::DESCRIPTION)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .value_parser(clap::value_parser!(PathBuf))
                    .help("Configuration file path (.toml or .json)")
                    .global(true)
                    .action(ArgAction::Set),
            )
            .arg(
                Arg::new("root")
                    .short('C')
                    .long("root")
                    .value_name("DIR")
                    .value_parser(clap::value_parser!(PathBuf))
                    .help("Project root (default: current directory)")
                    .global(true)
                    .action(ArgAction::Set),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .help("Increase verbosity (can be used multiple times)")
                    .global(true)
                    .action(ArgAction::Count),
            )
            .subcommand(
                Command::new("build")
                    .about("Bundle the project and compile it to Hermes bytecode")
                    .args(pipeline_args.clone())
                    .arg(Arg::new("host").long("host").value_name("HOST").help("Host to pick the compiler for (linux, macos, windows)"))
                    .arg(Arg::new("keep-bundle").long("keep-bundle").help("Also write the intermediate JavaScript bundle").action(ArgAction::SetTrue))
                    .arg(Arg::new("debug").short('d').long("debug").help("Log every pipeline phase").action(ArgAction::SetTrue))
                    .arg(Arg::new("stats").long("stats").help("Print build statistics as JSON").action(ArgAction::SetTrue))
                    .arg(Arg::new("watch").short('w').long("watch").help("Watch the project and rebuild on changes").action(ArgAction::SetTrue)),
            )
            .subcommand(
                Command::new("bundle")
                    .about("Narrow and bundle without compiling")
                    .args(pipeline_args)
                    .arg(Arg::new("stdout").long("stdout").help("Print the bundle instead of writing it").action(ArgAction::SetTrue)),
            )
            .subcommand(
                Command::new("check")
                    .about("Parse, narrow and resolve the module graph without writing anything"),
            )
            .subcommand(
                Command::new("platform")
                    .about("Show which compiler binary a host uses")
                    .arg(Arg::new("host").help("Host identifier (default: this machine)").index(1)),
            )
            .subcommand(
                Command::new("transforms")
                    .about("List syntax transforms and whether each one runs")
                    .arg(
                        Arg::new("profile")
                            .short('p')
                            .long("profile")
                            .value_parser(clap::value_parser!(Profile))
                            .help("Target profile to evaluate"),
                    ),
            )
            .subcommand(
                Command::new("init")
                    .about("Write a default hbcpack.toml into the project root"),
            )
    }

    fn setup_logging(&self, verbose_count: u8) -> Result<()> {
        let log_level = match verbose_count {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        env_logger::Builder::from_default_env()
            .filter_level(log_level)
            .format_timestamp_secs()
            .init();
        Ok(())
    }

    /// Options from the config file (explicit or the project's own)
    pub fn load_options(&self) -> Result<BuildOptions> {
        match &self.config_path {
            Some(path) => config::load(path)?.into_options(&self.root),
            None => config::load_project(&self.root),
        }
    }

    /// Config file options with command-line flags layered on top
    pub fn build_options(&self, matches: &ArgMatches) -> Result<BuildOptions> {
        let mut options = self.load_options()?;
        apply_pipeline_flags(&mut options, matches)?;
        Ok(options)
    }
}

fn flag(matches: &ArgMatches, id: &str) -> bool {
    matches!(matches.try_get_one::<bool>(id), Ok(Some(true)))
}

fn apply_pipeline_flags(options: &mut BuildOptions, matches: &ArgMatches) -> Result<()> {
    if let Some(profile) = matches.get_one::<Profile>("profile") {
        options.profile = (*profile).into();
    }
    if let Some(include) = matches.get_many::<String>("include") {
        for name in include {
            options.rules.included.insert(name.parse::<Transform>()?);
        }
    }
    if let Some(exclude) = matches.get_many::<String>("exclude") {
        for name in exclude {
            options.rules.excluded.insert(name.parse::<Transform>()?);
        }
    }
    if let Some(defines) = matches.get_many::<String>("define") {
        for define in defines {
            match define.split_once('=') {
                Some((key, value)) => {
                    options
                        .bundle
                        .defines
                        .insert(key.trim().to_string(), value.to_string());
                }
                None => {
                    return Err(BuildError::invalid_format(format!(
                        "Invalid define: {}. Use NAME=VALUE format.",
                        define
                    )))
                }
            }
        }
    }
    if flag(matches, "minify") {
        options.bundle.minify = true;
    }
    if let Some(out_dir) = matches.get_one::<PathBuf>("out-dir") {
        options.out_dir = out_dir.clone();
    }
    if let Ok(Some(host)) = matches.try_get_one::<String>("host") {
        options.host = Some(host.clone());
    }
    if flag(matches, "keep-bundle") {
        options.keep_bundle = true;
    }
    if flag(matches, "debug") {
        options.debug_mode = true;
    }
    Ok(())
}
