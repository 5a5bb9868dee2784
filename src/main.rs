//! slide-core CLI - inspect and extract from whole-slide images.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use url::Url;

use slide_core::{
    Cli, Command, FileSource, Image, ImageError, InfoConfig, PixelFormat, RegionConfig,
    RemoteSource, SegmentCache, SharedSource,
};

const EXIT_BAD_ARGUMENTS: u8 = 1;
const EXIT_OPEN_FAILED: u8 = 2;
const EXIT_UNSUPPORTED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Info(config) => run_info(config).await,
        Command::Region(config) => run_region(config).await,
    }
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "slide_core=warn",
        1 => "slide_core=info",
        _ => "slide_core=debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Open a slide from a local path or a remote endpoint + filename.
async fn open_slide(
    slide: &str,
    endpoint: Option<&str>,
) -> Result<Arc<Image>, (u8, String)> {
    if let Some(endpoint) = endpoint {
        let base = Url::parse(endpoint)
            .map_err(|e| (EXIT_BAD_ARGUMENTS, format!("bad endpoint URL: {e}")))?;
        let remote = RemoteSource::connect(base, slide)
            .await
            .map_err(|e| (EXIT_OPEN_FAILED, e.to_string()))?;
        return Image::open_remote_tiff(remote)
            .await
            .map_err(classify_open_error);
    }

    // Header parsing issues many small scattered reads; the segment cache
    // amortises them into a handful of aligned reads.
    let file = FileSource::open(slide).map_err(|e| (EXIT_OPEN_FAILED, e.to_string()))?;
    let source: SharedSource = Arc::new(SegmentCache::new(file));
    Image::open(source).await.map_err(classify_open_error)
}

fn classify_open_error(e: ImageError) -> (u8, String) {
    let code = match &e {
        ImageError::UnsupportedFormat { .. } => EXIT_UNSUPPORTED,
        ImageError::Tiff(slide_core::TiffError::UnsupportedCompression(_))
        | ImageError::Tiff(slide_core::TiffError::UnsupportedPhotometric(_))
        | ImageError::Tiff(slide_core::TiffError::StripOrganization) => EXIT_UNSUPPORTED,
        _ => EXIT_OPEN_FAILED,
    };
    (code, e.to_string())
}

async fn run_info(config: InfoConfig) -> ExitCode {
    let image = match open_slide(&config.slide, config.endpoint.as_deref()).await {
        Ok(image) => image,
        Err((code, message)) => {
            error!("{message}");
            return ExitCode::from(code);
        }
    };

    let (width, height) = image.dimensions();
    let (mpp_x, mpp_y) = image.mpp();

    println!("{}", image.identifier());
    println!("  backend:  {}", image.backend_name());
    println!("  size:     {width} x {height} px");
    println!("  mpp:      {mpp_x:.4} x {mpp_y:.4} um/px");
    println!("  levels:   {}", image.level_count());
    println!(
        "  tiles:    {} x {} px",
        image.tile_size().0,
        image.tile_size().1
    );
    for level in image.levels() {
        println!(
            "    level {:2}: {:>9} x {:<9} {} ({} x {} tiles)",
            level.level,
            level.width_in_pixels,
            level.height_in_pixels,
            if level.exists { "" } else { "(missing)" },
            level.width_in_tiles,
            level.height_in_tiles,
        );
    }

    ExitCode::SUCCESS
}

async fn run_region(config: RegionConfig) -> ExitCode {
    if config.width == 0 || config.height == 0 {
        error!("region must have non-zero dimensions");
        return ExitCode::from(EXIT_BAD_ARGUMENTS);
    }

    let image = match open_slide(&config.slide, config.endpoint.as_deref()).await {
        Ok(image) => image,
        Err((code, message)) => {
            error!("{message}");
            return ExitCode::from(code);
        }
    };

    let mut bgra = vec![0u8; (config.width as usize * config.height as usize) * 4];
    if let Err(e) = image
        .read_region(
            config.level,
            config.x,
            config.y,
            config.width,
            config.height,
            &mut bgra,
            PixelFormat::Bgra8,
        )
        .await
    {
        error!("read_region failed: {e}");
        return ExitCode::from(EXIT_OPEN_FAILED);
    }

    // BGRA -> RGBA for the encoder
    for px in bgra.chunks_exact_mut(4) {
        px.swap(0, 2);
    }

    let Some(buffer) =
        image::RgbaImage::from_raw(config.width, config.height, bgra)
    else {
        error!("region buffer size mismatch");
        return ExitCode::from(EXIT_OPEN_FAILED);
    };

    if let Err(e) = buffer.save(&config.output) {
        error!("could not write {}: {e}", config.output);
        return ExitCode::from(EXIT_OPEN_FAILED);
    }

    println!(
        "wrote {} ({} x {} at level {})",
        config.output, config.width, config.height, config.level
    );
    ExitCode::SUCCESS
}
