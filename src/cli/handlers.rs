use super::{EnhancedCli, Profile};
use crate::config;
use crate::error::{BuildError, Result};
use crate::narrower::{TargetProfile, Transform};
use crate::platform::{current_host_id, HostOs};
use crate::types::CONFIG_FILE_NAME;
use crate::writer::ArtifactWriter;
use crate::{build_with_options, bundle_with_options, BuildOptions, BuildStats};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

// --- BUILD ---
pub fn handle_build_command(cli: &EnhancedCli, matches: &clap::ArgMatches) -> Result<()> {
    let options = cli.build_options(matches)?;

    if matches.get_flag("watch") {
        watch_and_build(&options)
    } else {
        let stats = build_once(&options)?;
        if matches.get_flag("stats") {
            print_stats_json(&stats)?;
        }
        Ok(())
    }
}

fn build_once(options: &BuildOptions) -> Result<BuildStats> {
    println!(
        "🔨 Building {} -> {}",
        options.root.join(&options.bundle.entry).display(),
        options.output_dir().display()
    );

    let stats = build_with_options(options)?;

    println!("✅ Build successful!");
    println!("   Artifact: {}", stats.artifact.display());
    println!("   Modules: {}", stats.modules);
    println!(
        "   Bundle: {} bytes -> bytecode: {} bytes",
        stats.bundle_size, stats.bytecode_size
    );
    if let Some(version) = stats.bytecode_version {
        println!("   Bytecode version: {}", version);
    }
    println!("   MD5: {}", stats.md5);
    println!("   Time: {}ms", stats.compile_time_ms);
    Ok(stats)
}

fn print_stats_json(stats: &BuildStats) -> Result<()> {
    let json = serde_json::to_string_pretty(stats)
        .map_err(|e| BuildError::invalid_format(format!("Cannot serialize stats: {}", e)))?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", json)?;
    Ok(())
}

fn watch_and_build(options: &BuildOptions) -> Result<()> {
    let root = &options.root;
    println!("👀 Watching {} for changes...", root.display());

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if let Err(e) = tx.send(event) {
                    eprintln!("Watch error: {}", e);
                }
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| {
        BuildError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to create file watcher: {}", e),
        ))
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| {
            BuildError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to watch {}: {}", root.display(), e),
            ))
        })?;

    if let Err(e) = build_with_options(options) {
        eprintln!("❌ Initial build failed: {}", e);
    } else {
        println!("✅ Initial build successful");
    }

    // Event paths are absolute
    let out_dir = options.output_dir();
    let out_dir = fs::canonicalize(&out_dir)
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(&out_dir)))
        .unwrap_or(out_dir);
    loop {
        match rx.recv() {
            Ok(event) => {
                if !is_source_change(&event, &out_dir) {
                    continue;
                }
                // Editors tend to emit several events per save
                std::thread::sleep(Duration::from_millis(100));
                while rx.try_recv().is_ok() {}

                println!("🔄 Source changed, rebuilding...");
                match build_with_options(options) {
                    Ok(stats) => println!(
                        "✅ Rebuilt successfully ({} bytes, {}ms)",
                        stats.bytecode_size, stats.compile_time_ms
                    ),
                    Err(e) => eprintln!("❌ Build failed: {}", e),
                }
            }
            Err(e) => {
                eprintln!("Watch error: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Changes to our own output must not trigger another build
fn is_source_change(event: &Event, out_dir: &Path) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    relevant && event.paths.iter().any(|path| !path.starts_with(out_dir))
}

// --- BUNDLE ---
pub fn handle_bundle_command(cli: &EnhancedCli, matches: &clap::ArgMatches) -> Result<()> {
    let options = cli.build_options(matches)?;
    let output = bundle_with_options(&options)?;

    if matches.get_flag("stdout") {
        let mut stdout = std::io::stdout();
        stdout.write_all(output.artifact.code.as_bytes())?;
        return Ok(());
    }

    let path = ArtifactWriter::new(options.output_dir()).write_bundle(&output.artifact)?;
    println!("📦 Bundled {} modules", output.artifact.modules.len());
    println!("   Output: {} ({} bytes)", path.display(), output.artifact.size());
    Ok(())
}

// --- CHECK ---
pub fn handle_check_command(cli: &EnhancedCli, _matches: &clap::ArgMatches) -> Result<()> {
    let options = cli.load_options()?;
    println!("🔍 Checking {}", options.root.join(&options.bundle.entry).display());

    let check_start = Instant::now();
    match bundle_with_options(&options) {
        Ok(output) => {
            for module in &output.artifact.modules {
                println!("   {}", module);
            }
            println!(
                "✅ {} modules, no issues found ({}ms)",
                output.artifact.modules.len(),
                check_start.elapsed().as_millis()
            );
            if !output.applied.is_empty() {
                println!("\n📊 Rewrites:");
                for (transform, count) in &output.applied {
                    println!("   {:<30} {}", transform.name(), count);
                }
            }
            if output.jsx_elements > 0 {
                println!("   {:<30} {}", "jsx elements", output.jsx_elements);
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            Err(e)
        }
    }
}

// --- PLATFORM ---
pub fn handle_platform_command(cli: &EnhancedCli, matches: &clap::ArgMatches) -> Result<()> {
    let options = cli.load_options()?;
    let host = matches
        .get_one::<String>("host")
        .cloned()
        .or_else(|| options.host.clone())
        .unwrap_or_else(|| current_host_id().to_string());

    let dispatcher = options.compiler.dispatcher(&options.root);
    println!("🖥️  Compiler table:");
    for (entry_host, path) in dispatcher.descriptor().entries() {
        let marker = if path.is_file() { "✅" } else { "  " };
        println!("   {} {:<8} {}", marker, entry_host.name(), path.display());
    }

    let parsed = HostOs::parse(&host)?;
    println!("\nHost '{}' ({}):", host, parsed);
    match dispatcher.dispatch(&host) {
        Ok(path) => {
            println!("   ✅ {}", path.display());
            Ok(())
        }
        Err(e) => {
            println!("   ❌ {}", e);
            Err(e)
        }
    }
}

// --- TRANSFORMS ---
pub fn handle_transforms_command(cli: &EnhancedCli, matches: &clap::ArgMatches) -> Result<()> {
    let options = cli.load_options()?;
    let profile: TargetProfile = matches
        .get_one::<Profile>("profile")
        .map(|p| (*p).into())
        .unwrap_or(options.profile);

    let defaults = profile.default_transforms();
    let effective = options.rules.effective(profile);

    println!("🔧 Transforms for profile '{}':", profile.name());
    for transform in Transform::ALL {
        let marker = if effective.contains(&transform) { "✅" } else { "  " };
        let source = if options.rules.excluded.contains(&transform) {
            "excluded"
        } else if options.rules.included.contains(&transform) {
            "included"
        } else if defaults.contains(&transform) {
            "profile"
        } else {
            ""
        };
        println!(
            "   {} {:<30} {:<9} {}",
            marker,
            transform.name(),
            source,
            transform.description()
        );
    }
    println!("\n   JSX mode: {}", options.jsx.name());
    Ok(())
}

// --- INIT ---
pub fn handle_init_command(cli: &EnhancedCli, _matches: &clap::ArgMatches) -> Result<()> {
    let path = cli.root().join(CONFIG_FILE_NAME);
    if path.exists() {
        return Err(BuildError::invalid_format(format!(
            "{} already exists; not overwriting it",
            path.display()
        )));
    }

    fs::create_dir_all(cli.root())?;
    fs::write(&path, config::default_toml()).map_err(|e| BuildError::write(&path, e))?;

    println!("🚀 Created {}", path.display());
    println!("\nNext steps:");
    println!("   Add your entry module (index.js)");
    println!("   hbcpack build");
    log::debug!("init finished in {}ms", cli.elapsed_ms());
    Ok(())
}
