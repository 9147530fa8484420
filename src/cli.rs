use crate::{
    browser::Browser,
    config::AppConfig,
    index::ModRecord,
    logging,
    mirror::{self, SyncOutcome},
    service::CatalogService,
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    io::{self, IsTerminal, Write},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            _ => bail!("Unknown format: {value} (use 'text' or 'json')"),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct GlobalOptions {
    format: Option<OutputFormat>,
    data_dir: Option<PathBuf>,
    verbose: bool,
    with_images: bool,
}

impl GlobalOptions {
    fn format(&self) -> OutputFormat {
        self.format.unwrap_or(OutputFormat::Text)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    List(ListOptions),
    Refresh,
    Show(String),
    Status,
    Paths,
    Help,
    Version,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ListOptions {
    sort: SortKey,
    reverse: bool,
    filter: Option<String>,
    installed: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum SortKey {
    #[default]
    Discovery,
    Title,
    Author,
    Folder,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("Pokerface v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config = AppConfig::load_or_create(global.data_dir.as_deref())?;
            if let Err(err) = logging::init(&config.log_path(), global.verbose) {
                eprintln!("Logging disabled: {err:#}");
            }
            if let Err(err) = mirror::configure_transport(config.sync_timeout()) {
                warn!("Could not set git transport timeouts: {err}");
            }
            let service = Arc::new(CatalogService::from_config(&config));
            run_command(&config, Browser::new(service), command, &global)
        }
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let (global, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok((global, CliCommand::List(ListOptions::default())));
    };

    let command = match head.as_str() {
        "--help" | "-h" | "help" => CliCommand::Help,
        "--version" | "-V" | "version" => CliCommand::Version,
        "list" | "mods" => CliCommand::List(parse_list(&tokens[1..])?),
        "refresh" | "sync" => CliCommand::Refresh,
        "show" | "info" => {
            let key = tokens
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("show requires a mod title or folder"))?;
            CliCommand::Show(key.to_string())
        }
        "status" => CliCommand::Status,
        "paths" => CliCommand::Paths,
        other => bail!("Unknown command: {other} (see --help)"),
    };
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut global = GlobalOptions::default();
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            global.format = Some(OutputFormat::parse(value)?);
            continue;
        }
        if let Some(value) = arg.strip_prefix("--data-dir=") {
            global.data_dir = Some(PathBuf::from(value));
            continue;
        }
        match arg.as_str() {
            "--format" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--format requires a value"))?;
                global.format = Some(OutputFormat::parse(value)?);
            }
            "--data-dir" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--data-dir requires a path"))?;
                global.data_dir = Some(PathBuf::from(value));
            }
            "-v" | "--verbose" => global.verbose = true,
            "--with-images" => global.with_images = true,
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((global, tokens))
}

fn parse_list(args: &[String]) -> Result<ListOptions> {
    let mut options = ListOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--sort" => {
                let Some(value) = iter.next() else {
                    bail!("--sort requires a value");
                };
                options.sort = parse_sort_key(value)?;
            }
            value if value.starts_with("--sort=") => {
                options.sort = parse_sort_key(value.trim_start_matches("--sort="))?;
            }
            "--reverse" | "-r" => options.reverse = true,
            "--filter" => {
                let Some(value) = iter.next() else {
                    bail!("--filter requires a value");
                };
                options.filter = Some(value.to_string());
            }
            value if value.starts_with("--filter=") => {
                options.filter = Some(value.trim_start_matches("--filter=").to_string());
            }
            "--installed" => {
                let Some(value) = iter.next() else {
                    bail!("--installed requires a mod title");
                };
                if !options.installed.contains(value) {
                    options.installed.push(value.to_string());
                }
            }
            other => bail!("Unknown list option: {other}"),
        }
    }
    Ok(options)
}

fn parse_sort_key(value: &str) -> Result<SortKey> {
    match value {
        "discovery" | "order" => Ok(SortKey::Discovery),
        "title" | "name" => Ok(SortKey::Title),
        "author" => Ok(SortKey::Author),
        "folder" => Ok(SortKey::Folder),
        "version" => Ok(SortKey::Version),
        _ => bail!("Unknown sort key: {value}"),
    }
}

fn run_command(
    config: &AppConfig,
    mut browser: Browser,
    command: CliCommand,
    global: &GlobalOptions,
) -> Result<()> {
    match command {
        CliCommand::List(options) => {
            browser.startup().context("load mod catalog")?;
            report_failures(&browser);
            list_mods(&mut browser, options, global)
        }
        CliCommand::Refresh => {
            let outcome = if io::stderr().is_terminal() {
                refresh_with_progress(&mut browser)?
            } else {
                browser.refresh().context("refresh mod catalog")?
            };
            report_failures(&browser);
            println!("{}", outcome.describe());
            println!("{}", browser.status());
            Ok(())
        }
        CliCommand::Show(key) => {
            browser.startup().context("load mod catalog")?;
            let record = browser
                .find(&key)
                .ok_or_else(|| anyhow::anyhow!("No mod titled or stored as '{key}'"))?;
            show_mod(record, global)
        }
        CliCommand::Status => show_status(&browser, global.format()),
        CliCommand::Paths => show_paths(config, global.format()),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

fn refresh_with_progress(browser: &mut Browser) -> Result<SyncOutcome> {
    browser.spawn_refresh();
    eprint!("{}", browser.status());
    let mut ticks = 0u32;
    loop {
        if let Some(result) = browser.poll() {
            eprintln!();
            return result.context("refresh mod catalog");
        }
        if !browser.refresh_in_flight() {
            eprintln!();
            bail!("{}", browser.status());
        }
        ticks += 1;
        if ticks % 10 == 0 {
            eprint!(".");
            let _ = io::stderr().flush();
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn report_failures(browser: &Browser) {
    for failure in browser.failures() {
        eprintln!("Skipped mods/{}: {}", failure.folder, failure.message);
    }
}

fn output_record(record: &ModRecord, with_images: bool) -> ModRecord {
    let mut record = record.clone();
    if !with_images {
        record.image_b64 = None;
    }
    record
}

fn list_mods(browser: &mut Browser, options: ListOptions, global: &GlobalOptions) -> Result<()> {
    if let Some(filter) = &options.filter {
        browser.set_filter(filter);
    }
    for title in &options.installed {
        if browser.toggle_installed(title).is_none() {
            eprintln!("No mod titled '{title}' to mark installed");
        }
    }
    let mut items = browser.visible();

    match options.sort {
        SortKey::Discovery => {}
        SortKey::Title => items.sort_by_key(|record| record.meta.title.to_lowercase()),
        SortKey::Author => items.sort_by_key(|record| record.meta.author.to_lowercase()),
        SortKey::Folder => items.sort_by(|a, b| a.folder_name.cmp(&b.folder_name)),
        SortKey::Version => items.sort_by_key(|record| record.meta.version_triple()),
    }
    if options.reverse {
        items.reverse();
    }

    match global.format() {
        OutputFormat::Json => {
            let out: Vec<ModRecord> = items
                .into_iter()
                .map(|record| output_record(record, global.with_images))
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            if items.is_empty() {
                if browser.filter().is_empty() {
                    println!("The catalog has no mods.");
                } else {
                    println!("No mods found matching \"{}\"", browser.filter());
                }
            }
            let shown = items.len();
            for record in items {
                let version = record.meta.version.as_deref().unwrap_or("-");
                let mark = if record.installed { "*" } else { " " };
                println!(
                    "{mark} {title:<32} {version:<12} {author:<20} {categories}",
                    title = record.meta.title,
                    author = record.meta.author,
                    categories = record.meta.categories_label()
                );
            }
            if shown > 0 && shown < browser.records().len() {
                println!("Showing {shown} of {} mods", browser.records().len());
            }
        }
    }
    Ok(())
}

fn show_mod(record: &ModRecord, global: &GlobalOptions) -> Result<()> {
    if global.format() == OutputFormat::Json {
        let out = output_record(record, global.with_images);
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let meta = &record.meta;
    println!("{}", meta.title);
    println!("Author: {}", meta.author);
    if let Some(version) = &meta.version {
        println!("Version: {version}");
    }
    println!("Categories: {}", meta.categories_label());
    if let Some(auto) = meta.automatic_version_check {
        println!("Auto-Update: {}", yes_no(auto));
    }
    println!("Folder: {}", record.folder_name);
    println!("Steamodded: {}", yes_no(meta.requires_steamodded));
    println!("Talisman: {}", yes_no(meta.requires_talisman));
    println!("Repo: {}", meta.repo);
    println!("Download: {}", meta.download_url);
    if let Some(bytes) = record.thumbnail_bytes() {
        println!("Thumbnail: {} bytes", bytes.len());
    }
    if let Some(description) = &record.description {
        println!();
        println!("{}", description.trim_end());
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

#[derive(Serialize)]
struct StatusOutput {
    mirror: String,
    exists: bool,
    url: String,
    branch: String,
    revision: Option<String>,
    mods: Option<usize>,
    last_sync: Option<String>,
    last_outcome: Option<String>,
}

fn show_status(browser: &Browser, format: OutputFormat) -> Result<()> {
    let mirror = browser.service().mirror();
    let record = mirror.last_sync();
    let output = StatusOutput {
        mirror: mirror.root().display().to_string(),
        exists: mirror.exists(),
        url: mirror.url().to_string(),
        branch: mirror.branch().to_string(),
        revision: mirror.revision(),
        mods: browser.service().count_mods().ok(),
        last_sync: record.as_ref().map(|record| record.synced_at.clone()),
        last_outcome: record.map(|record| record.outcome),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => {
            println!("Mirror: {}", output.mirror);
            println!("Remote: {} ({})", output.url, output.branch);
            if !output.exists {
                println!("State: not synced yet (run 'pokerface refresh')");
                return Ok(());
            }
            println!(
                "Revision: {}",
                output.revision.as_deref().unwrap_or("unknown")
            );
            match output.mods {
                Some(count) => println!("Mods: {count}"),
                None => println!("Mods: catalog unreadable"),
            }
            match (&output.last_sync, &output.last_outcome) {
                (Some(at), Some(outcome)) => println!("Last sync: {at} ({outcome})"),
                _ => println!("Last sync: never recorded"),
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct PathsOutput {
    data_dir: String,
    config: String,
    log: String,
    mirror: String,
}

fn show_paths(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let output = PathsOutput {
        data_dir: config.data_dir.display().to_string(),
        config: config.config_path().display().to_string(),
        log: config.log_path().display().to_string(),
        mirror: config.mirror_root().display().to_string(),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => {
            println!("Data dir: {}", output.data_dir);
            println!("Config: {}", output.config);
            println!("Log: {}", output.log);
            println!("Mirror: {}", output.mirror);
        }
    }
    Ok(())
}

fn print_help() {
    println!("Pokerface v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  pokerface                          Sync if needed, then list mods");
    println!("  pokerface list                     List mods in the catalog");
    println!("  pokerface refresh                  Clone or pull the catalog now");
    println!("  pokerface show <title|folder>      Show details for one mod");
    println!("  pokerface status                   Show mirror state");
    println!("  pokerface paths                    Show data paths");
    println!();
    println!("List options:");
    println!("  --filter <query>                   Fuzzy match on title and categories");
    println!("  --sort <discovery|title|author|folder|version>");
    println!("  -r, --reverse                      Reverse the order");
    println!("  --installed <title>                Mark a mod installed for this listing");
    println!();
    println!("Global options:");
    println!("  --format <text|json>               Output format");
    println!("  --with-images                      Include base64 thumbnails in JSON");
    println!("  --data-dir <path>                  Use another data directory");
    println!("  -v, --verbose                      Debug logging");
    println!("  -h, --help                         Show help");
    println!("  -V, --version                      Show version");
}
