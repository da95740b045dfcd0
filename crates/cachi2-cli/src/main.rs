mod progress;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use cachi2_core::EnvFormat;
use cachi2_types::{PackageInput, RelPath, Request, RequestFlags};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "cachi2", version)]
#[command(about = "Pre-fetches project dependencies and generates an SBOM for hermetic builds")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve every requested package, fetch and verify its dependencies,
    /// and write `bom.json`/`output.json` under `--output`.
    FetchDeps(FetchDepsArgs),
    /// Print the environment variables a prior `fetch-deps` run produced.
    GenerateEnv(GenerateEnvArgs),
    /// Rewrite project files a prior `fetch-deps` run edited, remapping
    /// the output directory path when the build runs somewhere else.
    InjectFiles(InjectFilesArgs),
}

#[derive(Parser, Debug)]
struct FetchDepsArgs {
    /// Root of the project being built. Must be a git working tree.
    #[arg(long, default_value = ".")]
    source: PathBuf,

    /// Directory cachi2 writes fetched dependencies and the SBOM into.
    #[arg(long)]
    output: PathBuf,

    /// Disable cgo when driving the Go toolchain.
    #[arg(long)]
    cgo_disable: bool,

    /// Re-run `go mod tidy` even if go.sum already looks complete.
    #[arg(long)]
    force_gomod_tidy: bool,

    /// Resolve dev-only package managers as well.
    #[arg(long)]
    dev_package_managers: bool,

    /// Fail if the Go module's committed `vendor/` diverges from go.mod.
    #[arg(long)]
    gomod_vendor_check: bool,

    /// A package-kind string (e.g. `"npm"`), a single `{type, path, ...}`
    /// object, an array of such objects, or `{"packages": [...], "flags": {...}}`.
    packages: String,
}

#[derive(Parser, Debug)]
struct GenerateEnvArgs {
    /// Output directory a prior `fetch-deps` run wrote into.
    #[arg(long)]
    output: PathBuf,

    /// Assignment format to render.
    #[arg(long, value_enum, default_value_t = EnvFormatArg::Env)]
    format: EnvFormatArg,

    /// Remap absolute paths under `--output` to this path before rendering.
    #[arg(long = "for-output-dir")]
    for_output_dir: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EnvFormatArg {
    Env,
    Json,
    Dotenv,
}

#[derive(Parser, Debug)]
struct InjectFilesArgs {
    /// Output directory a prior `fetch-deps` run wrote into.
    #[arg(long)]
    output: PathBuf,

    /// Remap absolute paths under `--output` to this path in every edited file.
    #[arg(long = "for-output-dir")]
    for_output_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::FetchDeps(args) => run_fetch_deps(args),
        Commands::GenerateEnv(args) => run_generate_env(args),
        Commands::InjectFiles(args) => run_inject_files(args),
    }
}

fn run_fetch_deps(args: FetchDepsArgs) -> Result<()> {
    let base_flags = RequestFlags {
        gomod_vendor_check: args.gomod_vendor_check,
        force_gomod_tidy: args.force_gomod_tidy,
        gomod_cgo_disable: args.cgo_disable,
        dev_package_managers: args.dev_package_managers,
        ..RequestFlags::default()
    };
    let (packages, flags) = parse_packages_arg(&args.packages, base_flags)?;

    let request = Request {
        source_dir: args.source,
        output_dir: args.output,
        packages,
        flags,
    };
    let request = cachi2_schema::validate_request(request).context("request validation failed")?;

    let mut reporter = ProgressReporter::new(request.packages.len());
    let outcome = cachi2_core::fetch_deps(&request)?;

    for (index, summary) in outcome.package_summaries.iter().enumerate() {
        reporter.set_package(index + 1, &summary.package_manager.to_string(), &summary.path.display().to_string());
        reporter.finish_package();
    }
    reporter.finish();

    println!("wrote {}", outcome.bom_path.display());
    println!("wrote {}", outcome.output_json_path.display());
    println!(
        "{} component(s) resolved across {} package(s)",
        outcome.component_count,
        outcome.package_summaries.len()
    );

    Ok(())
}

fn run_generate_env(args: GenerateEnvArgs) -> Result<()> {
    let format = match args.format {
        EnvFormatArg::Env => EnvFormat::Env,
        EnvFormatArg::Json => EnvFormat::Json,
        EnvFormatArg::Dotenv => EnvFormat::Dotenv,
    };

    let rendered = cachi2_core::generate_env(&args.output, format, args.for_output_dir.as_deref())?;
    println!("{rendered}");
    Ok(())
}

fn run_inject_files(args: InjectFilesArgs) -> Result<()> {
    let rewritten = cachi2_core::inject_files(&args.output, args.for_output_dir.as_deref())?;

    if rewritten.is_empty() {
        eprintln!(
            "[info] nothing to inject ({})",
            if args.for_output_dir.is_some() {
                "no edited files matched the output directory prefix"
            } else {
                "pass --for-output-dir when injecting into a different mount point"
            }
        );
    } else {
        for path in &rewritten {
            println!("rewrote {}", path.display());
        }
    }

    Ok(())
}

/// The positional packages argument accepts four shapes: a bare
/// package-kind string, a single tagged package object, an array of such
/// objects, or the full `{packages, flags}` form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PackagesArg {
    Kind(String),
    Single(PackageInput),
    List(Vec<PackageInput>),
    Full {
        packages: Vec<PackageInput>,
        #[serde(default)]
        flags: serde_json::Value,
    },
}

fn parse_packages_arg(raw: &str, base_flags: RequestFlags) -> Result<(Vec<PackageInput>, RequestFlags)> {
    let arg: PackagesArg = serde_json::from_str(raw).context("failed to parse packages argument as JSON")?;

    Ok(match arg {
        PackagesArg::Kind(kind) => (vec![package_input_for_kind(&kind)?], base_flags),
        PackagesArg::Single(input) => (vec![input], base_flags),
        PackagesArg::List(inputs) => (inputs, base_flags),
        PackagesArg::Full { packages, flags } => {
            let flags = if flags.is_null() {
                base_flags
            } else {
                serde_json::from_value(flags).context("failed to parse `flags`")?
            };
            (packages, flags)
        }
    })
}

/// A bare package-kind string (e.g. `"npm"`) names a single package rooted
/// at the source directory itself.
fn package_input_for_kind(kind: &str) -> Result<PackageInput> {
    let path = RelPath::new(".");
    Ok(match kind {
        "gomod" => PackageInput::Gomod { path },
        "pip" => PackageInput::Pip {
            path,
            requirements_files: vec![],
            requirements_build_files: vec![],
            allow_binary: false,
        },
        "npm" => PackageInput::Npm { path },
        "yarn-classic" => PackageInput::YarnClassic { path },
        "yarn-berry" => PackageInput::YarnBerry { path },
        "cargo" => PackageInput::Cargo { path },
        "bundler" => PackageInput::Bundler { path, allow_binary: false },
        "generic" => PackageInput::Generic { path, lockfile: None },
        other => bail!("unknown package kind `{other}`"),
    })
}
