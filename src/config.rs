//! CLI configuration for the `slide-core` wrapper binary.
//!
//! The binary is a thin inspection tool over the library: it opens a slide,
//! reports its geometry, or extracts a region to a PNG. All options can
//! also come from `SLIDE_`-prefixed environment variables.
//!
//! # Exit codes
//!
//! - `0` success
//! - `1` bad arguments
//! - `2` could not open the file
//! - `3` unsupported format

use clap::{Args, Parser, Subcommand};

/// Default tile cache capacity for the CLI, in megabytes.
pub const DEFAULT_CLI_CACHE_MB: usize = 256;

/// slide-core - inspect and extract from whole-slide images.
#[derive(Parser, Debug, Clone)]
#[command(name = "slide-core")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose logging (repeat for more detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Subcommands of the wrapper binary.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print slide geometry and metadata.
    Info(InfoConfig),

    /// Extract a region to a PNG file.
    Region(RegionConfig),
}

/// Arguments for `slide-core info`.
#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    /// Path to the slide file, or a URL for a remote slide.
    pub slide: String,

    /// Remote endpoint origin (e.g. https://host:2000) when `slide` is a
    /// remote filename rather than a local path.
    #[arg(long, env = "SLIDE_REMOTE_ENDPOINT")]
    pub endpoint: Option<String>,
}

/// Arguments for `slide-core region`.
#[derive(Args, Debug, Clone)]
pub struct RegionConfig {
    /// Path to the slide file, or a URL for a remote slide.
    pub slide: String,

    /// Pyramid level to read from (0 = full resolution).
    #[arg(short, long, default_value_t = 0, env = "SLIDE_LEVEL")]
    pub level: u32,

    /// Region origin X in level pixels.
    #[arg(short, long, default_value_t = 0)]
    pub x: i64,

    /// Region origin Y in level pixels.
    #[arg(short, long, default_value_t = 0)]
    pub y: i64,

    /// Region width in pixels.
    #[arg(short = 'W', long, default_value_t = 512)]
    pub width: u32,

    /// Region height in pixels.
    #[arg(short = 'H', long, default_value_t = 512)]
    pub height: u32,

    /// Output PNG path.
    #[arg(short, long, default_value = "region.png")]
    pub output: String,

    /// Remote endpoint origin when `slide` is a remote filename.
    #[arg(long, env = "SLIDE_REMOTE_ENDPOINT")]
    pub endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info() {
        let cli = Cli::try_parse_from(["slide-core", "info", "slide.tiff"]).unwrap();
        match cli.command {
            Command::Info(config) => assert_eq!(config.slide, "slide.tiff"),
            _ => panic!("expected info command"),
        }
    }

    #[test]
    fn test_parse_region_with_geometry() {
        let cli = Cli::try_parse_from([
            "slide-core",
            "region",
            "slide.tiff",
            "--level",
            "2",
            "-x",
            "1000",
            "-y",
            "2000",
            "-W",
            "256",
            "-H",
            "128",
        ])
        .unwrap();

        match cli.command {
            Command::Region(config) => {
                assert_eq!(config.level, 2);
                assert_eq!(config.x, 1000);
                assert_eq!(config.y, 2000);
                assert_eq!(config.width, 256);
                assert_eq!(config.height, 128);
            }
            _ => panic!("expected region command"),
        }
    }

    #[test]
    fn test_missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["slide-core"]).is_err());
    }
}
