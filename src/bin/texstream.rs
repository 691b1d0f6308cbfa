use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use texstream::j2c::J2cEngine as _;
use texstream::{
    BoostLevel, DirectoryFetcher, FormattedImage, ImageCodec, J2cConfig, PixelBuffer,
    StreamingConfig, TextureId, TextureList,
};

#[derive(Parser, Debug)]
#[command(name = "texstream", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print header metadata and per-level size estimates of an image file.
    Info(InfoArgs),
    /// Decode an image and re-encode it in the codec named by the output extension.
    Convert(ConvertArgs),
    /// Stream textures from a directory through the scheduler and report their final state.
    Stream(StreamArgs),
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Input image.
    #[arg(long = "in")]
    in_path: PathBuf,
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Input image.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output image; its extension picks the codec.
    #[arg(long)]
    out: PathBuf,

    /// Discard level to decode the input at.
    #[arg(long, default_value_t = 0)]
    discard: u8,

    /// Lossless J2C output.
    #[arg(long)]
    reversible: bool,

    /// Comment embedded in J2C output.
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Parser, Debug)]
struct StreamArgs {
    /// Directory holding `<id>.<ext>` assets.
    #[arg(long)]
    root: PathBuf,

    /// Streaming config JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// On-screen pixel area requested for every texture.
    #[arg(long, default_value_t = 1024.0 * 1024.0)]
    virtual_size: f32,

    /// Time limit in seconds.
    #[arg(long, default_value_t = 30.0)]
    max_secs: f32,

    /// Hex texture ids.
    #[arg(required = true)]
    ids: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Info(args) => cmd_info(args),
        Command::Convert(args) => cmd_convert(args),
        Command::Stream(args) => cmd_stream(args),
    }
}

fn open_image(path: &Path, j2c: J2cConfig) -> anyhow::Result<FormattedImage> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let codec = ImageCodec::from_file_name(name)
        .with_context(|| format!("no codec for '{}'", path.display()))?;
    let mut img = match codec {
        ImageCodec::J2c => FormattedImage::create_j2c(j2c),
        other => FormattedImage::create_from_type(other),
    };
    img.load(path, None)
        .with_context(|| format!("load image '{}'", path.display()))?;
    Ok(img)
}

fn cmd_info(args: InfoArgs) -> anyhow::Result<()> {
    let mut img = open_image(&args.in_path, J2cConfig::default())?;
    let levels: Vec<usize> = (0..=img.max_discard_level().min(texstream::j2c::MAX_DISCARD_LEVEL))
        .map(|level| img.calc_data_size(level))
        .collect();
    let report = serde_json::json!({
        "path": args.in_path.display().to_string(),
        "codec": img.codec(),
        "width": img.width(),
        "height": img.height(),
        "components": img.components(),
        "bytes": img.data_size(),
        "discard_level": img.discard_level(),
        "level_sizes": levels,
        "engine": texstream::j2c::engine().engine_info(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_convert(args: ConvertArgs) -> anyhow::Result<()> {
    let j2c = J2cConfig {
        reversible: args.reversible,
        ..J2cConfig::default()
    };
    let mut src = open_image(&args.in_path, j2c)?;
    src.set_discard_level(Some(args.discard));
    let mut raw = PixelBuffer::new();
    src.decode(&mut raw, Duration::ZERO)
        .with_context(|| format!("decode '{}'", args.in_path.display()))?;

    let name = args.out.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let codec = ImageCodec::from_file_name(name)
        .with_context(|| format!("no codec for '{}'", args.out.display()))?;
    let mut dst = match codec {
        ImageCodec::J2c => FormattedImage::create_j2c(j2c),
        other => FormattedImage::create_from_type(other),
    };
    dst.encode(&raw, args.comment.as_deref(), Duration::ZERO)
        .with_context(|| format!("encode {codec:?}"))?;

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    dst.save(&args.out)
        .with_context(|| format!("write '{}'", args.out.display()))?;

    eprintln!(
        "wrote {} ({}x{}x{}, {} bytes)",
        args.out.display(),
        raw.width(),
        raw.height(),
        raw.components(),
        dst.data_size()
    );
    Ok(())
}

fn cmd_stream(args: StreamArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => StreamingConfig::from_json_file(path)
            .with_context(|| format!("load streaming config '{}'", path.display()))?,
        None => StreamingConfig::default(),
    };
    let max_time = Duration::try_from_secs_f32(args.max_secs)
        .with_context(|| format!("invalid time limit {}", args.max_secs))?;

    let fetcher = DirectoryFetcher::new(&args.root)
        .with_context(|| format!("open asset directory '{}'", args.root.display()))?;
    let mut list = TextureList::with_decode_pool(config, Box::new(fetcher))?;
    let mut textures = Vec::with_capacity(args.ids.len());
    for raw_id in &args.ids {
        let id = u64::from_str_radix(raw_id.trim_start_matches("0x"), 16)
            .with_context(|| format!("parse texture id '{raw_id}'"))?;
        let tex = list.get_texture(TextureId(id), BoostLevel::None, None);
        tex.set_virtual_size(args.virtual_size);
        textures.push(tex);
    }

    let stats = list.decode_all_images(max_time);
    let report: Vec<_> = textures
        .iter()
        .map(|tex| {
            serde_json::json!({
                "id": tex.id().to_string(),
                "info": list.texture_info(tex.key()),
            })
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "stats": stats,
            "textures": report,
        }))?
    );
    Ok(())
}
