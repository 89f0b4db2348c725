//! # Tephra CLI
//!
//! Command-line interface for the Tephra texture build pipeline.
//!
//! ## Commands
//! - `cook` - Build a texture (or fetch it from the cache)
//! - `key` - Print the cache key a texture would build under
//! - `estimate` - Print the build memory estimate

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tephra_build::{
    estimate_physical_build, estimate_virtual_texture_build, AuthoringSettings, BuildOrchestrator,
    BuildOutputOptions, BuildRequest, EncodeSpeed, EncoderRegistry, SettingsResolver,
    TargetProfile, TextureEngineParameters, TextureSource,
};
use tephra_cache::{CacheStore, FileCacheStore};
use tephra_core::{CancellationToken, GammaSpace, ImageInfo, JobPriority, RawFormat, RawImage};

/// Tephra texture build CLI
#[derive(Parser)]
#[command(name = "tephra")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Cache directory
    #[arg(long, default_value = ".tephra-cache")]
    pub cache: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Build a texture, fetching from the cache when possible
    Cook {
        /// Source image (PNG, TGA, ...)
        source: PathBuf,

        /// Authoring settings JSON; defaults apply when omitted
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Target profile name
        #[arg(short, long, default_value = "host")]
        platform: String,

        /// Bypass the cache query and overwrite the prior entry
        #[arg(long)]
        force: bool,

        /// Build as a virtual texture
        #[arg(long)]
        vt: bool,
    },

    /// Print the cache key a texture would build under
    Key {
        /// Source image
        source: PathBuf,

        /// Authoring settings JSON
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Target profile name
        #[arg(short, long, default_value = "host")]
        platform: String,
    },

    /// Print the build memory estimate
    Estimate {
        /// Source image
        source: PathBuf,

        /// Authoring settings JSON
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Build as a virtual texture
        #[arg(long)]
        vt: bool,
    },
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Cook {
            source,
            settings,
            platform,
            force,
            vt,
        } => cook(&cli.cache, &source, settings.as_deref(), &platform, force, vt),
        Commands::Key {
            source,
            settings,
            platform,
        } => print_key(&source, settings.as_deref(), &platform),
        Commands::Estimate {
            source,
            settings,
            vt,
        } => print_estimate(&source, settings.as_deref(), vt),
    }
}

fn load_authoring(path: Option<&Path>, vt: bool) -> Result<AuthoringSettings> {
    let mut authoring = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing settings {}", path.display()))?
        }
        None => AuthoringSettings::default(),
    };
    if vt {
        authoring.virtual_streamable = true;
    }
    Ok(authoring)
}

fn load_source(path: &Path) -> Result<TextureSource> {
    let decoded = image::open(path)
        .with_context(|| format!("decoding image {}", path.display()))?
        .to_rgba8();
    let (width, height) = decoded.dimensions();

    let info = ImageInfo::new_2d(width, height, RawFormat::Bgra8, GammaSpace::Srgb);
    let mut raw = RawImage::new_black(info);
    for (x, y, pixel) in decoded.enumerate_pixels() {
        raw.write_texel(
            x,
            y,
            0,
            [
                pixel.0[0] as f32 / 255.0,
                pixel.0[1] as f32 / 255.0,
                pixel.0[2] as f32 / 255.0,
                pixel.0[3] as f32 / 255.0,
            ],
        );
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "texture".to_string());
    Ok(TextureSource::new_2d(name, raw))
}

fn target_profile(platform: &str) -> TargetProfile {
    match platform {
        "mobile" => TargetProfile {
            name: platform.to_string(),
            supports_bc: false,
            supports_astc: true,
            supports_etc: true,
            max_dimension: 4096,
            built_size_budget_bytes: None,
            tiler: None,
        },
        _ => TargetProfile {
            name: platform.to_string(),
            ..Default::default()
        },
    }
}

fn cook(
    cache_dir: &Path,
    source_path: &Path,
    settings_path: Option<&Path>,
    platform: &str,
    force: bool,
    vt: bool,
) -> Result<()> {
    let authoring = load_authoring(settings_path, vt)?;
    let source = load_source(source_path)?;
    let target = target_profile(platform);

    let registry = Arc::new(EncoderRegistry::with_default_encoders());
    let resolver = SettingsResolver::new(registry.as_ref());
    let fetch_or_build = resolver.resolve(&source, &authoring, &target, EncodeSpeed::Fast);
    let fetch_first = resolver.resolve(&source, &authoring, &target, EncodeSpeed::Final);
    if !fetch_or_build[0].can_build() {
        anyhow::bail!(
            "no encoder available for '{}' on target '{}'",
            source.name,
            target.name
        );
    }

    let store: Arc<dyn CacheStore> = Arc::new(FileCacheStore::new(cache_dir)?);
    let orchestrator =
        BuildOrchestrator::new(registry.clone(), store, TextureEngineParameters::default());

    let request = BuildRequest {
        texture_name: source.name.clone(),
        source,
        composite: None,
        settings_fetch_first: Some(fetch_first),
        settings_fetch_or_build: fetch_or_build,
        options: BuildOutputOptions {
            load_streaming_mips: true,
            ..Default::default()
        },
        force_rebuild: force,
        priority: JobPriority::Normal,
    };

    let outcome = orchestrator.build_blocking(request, &CancellationToken::new())?;

    println!("key:       {}", outcome.key);
    println!(
        "result:    {}",
        if outcome.cache_hit {
            if outcome.used_fetch_first {
                "cache hit (fetch-first)"
            } else {
                "cache hit"
            }
        } else {
            "built"
        }
    );
    println!(
        "texture:   {}x{} / {} mips / {:?}",
        outcome.description.top_mip_size_x,
        outcome.description.top_mip_size_y,
        outcome.description.num_mips,
        outcome.description.format,
    );
    println!("payload:   {} bytes resident", outcome.record.resident_size());
    for error in &outcome.node_errors {
        log::warn!("{error}");
    }
    Ok(())
}

fn print_key(source_path: &Path, settings_path: Option<&Path>, platform: &str) -> Result<()> {
    let authoring = load_authoring(settings_path, false)?;
    let source = load_source(source_path)?;
    let target = target_profile(platform);

    let registry = EncoderRegistry::with_default_encoders();
    let resolver = SettingsResolver::new(&registry);
    let settings = resolver.resolve(&source, &authoring, &target, EncodeSpeed::Fast);
    if !settings[0].can_build() {
        anyhow::bail!("no encoder available on target '{}'", target.name);
    }

    let key = tephra_build::compute_texture_key(&settings, &source.content_id(), None);
    println!("{key}");
    Ok(())
}

fn print_estimate(source_path: &Path, settings_path: Option<&Path>, vt: bool) -> Result<()> {
    let authoring = load_authoring(settings_path, vt)?;
    let source = load_source(source_path)?;

    let registry = EncoderRegistry::with_default_encoders();
    let resolver = SettingsResolver::new(&registry);
    let settings = resolver.resolve(
        &source,
        &authoring,
        &TargetProfile::default(),
        EncodeSpeed::Fast,
    );

    let estimate = if vt {
        estimate_virtual_texture_build(&settings, &source, num_cpus())
    } else {
        estimate_physical_build(&settings, &source)
    };
    println!(
        "peak {} bytes in {:?} phase",
        estimate.peak_bytes, estimate.peak_phase
    );
    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_profiles() {
        let host = target_profile("host");
        assert!(host.supports_bc);

        let mobile = target_profile("mobile");
        assert!(!mobile.supports_bc);
        assert!(mobile.supports_astc);
        assert_eq!(mobile.max_dimension, 4096);
    }

    #[test]
    fn test_default_authoring_round_trips_through_json() {
        let authoring = AuthoringSettings::default();
        let json = serde_json::to_string(&authoring).unwrap();
        let loaded: AuthoringSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, authoring);
    }
}
