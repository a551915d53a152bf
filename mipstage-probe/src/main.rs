#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod config;

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use clap::Parser;
use mipstage_vk::{
    ash::vk,
    binder::Resources,
    command::TransferRecorder,
    device::Device,
    instance::{Instance, VulkanLogLevel},
    layout::{self, Extent, ImageDimension},
    memory::PooledAllocator,
    resource::{ImageDesc, ImageKind},
    transfer::{self, TransferConfig},
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{CliExtentPolicy, CliQueueMode, FileConfig};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // Never reached: Off skips installing the subscriber.
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliFormat {
    R8,
    Rg8,
    #[default]
    Rgba8,
    Rgba16f,
    R32f,
    Rgba32f,
    Bc1,
    Bc3,
    Bc7,
    Etc2,
    Astc4x4,
    Astc8x8,
}

impl From<CliFormat> for vk::Format {
    fn from(value: CliFormat) -> Self {
        match value {
            CliFormat::R8 => vk::Format::R8_UNORM,
            CliFormat::Rg8 => vk::Format::R8G8_UNORM,
            CliFormat::Rgba8 => vk::Format::R8G8B8A8_UNORM,
            CliFormat::Rgba16f => vk::Format::R16G16B16A16_SFLOAT,
            CliFormat::R32f => vk::Format::R32_SFLOAT,
            CliFormat::Rgba32f => vk::Format::R32G32B32A32_SFLOAT,
            CliFormat::Bc1 => vk::Format::BC1_RGBA_UNORM_BLOCK,
            CliFormat::Bc3 => vk::Format::BC3_UNORM_BLOCK,
            CliFormat::Bc7 => vk::Format::BC7_UNORM_BLOCK,
            CliFormat::Etc2 => vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK,
            CliFormat::Astc4x4 => vk::Format::ASTC_4X4_UNORM_BLOCK,
            CliFormat::Astc8x8 => vk::Format::ASTC_8X8_UNORM_BLOCK,
        }
    }
}

#[derive(clap::Parser, Debug)]
#[command(version, about = "Inspect mip layouts and exercise staged uploads")]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    #[arg(long)]
    queue_mode: Option<CliQueueMode>,
    /// TOML config file. Defaults to config.toml in the user config dir.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the packed layout and copy regions of an image.
    Layout(ImageArgs),
    /// Upload a generated pattern to a GPU image and verify a readback.
    Upload(ImageArgs),
}

#[derive(clap::Args, Debug)]
struct ImageArgs {
    #[arg(long, default_value_t = 256)]
    width: u32,
    #[arg(long, default_value_t = 256)]
    height: u32,
    /// Anything above 1 makes a 3-D image.
    #[arg(long, default_value_t = 1)]
    depth: u32,
    /// Mip levels; the full chain when omitted.
    #[arg(long)]
    levels: Option<u32>,
    #[arg(long, default_value_t = 1)]
    layers: u32,
    /// Treat the layers as cube faces (a multiple of 6, default 6).
    #[arg(long)]
    cube: bool,
    #[arg(long, default_value = "rgba8")]
    format: CliFormat,
    /// Staging offset alignment, a power of two.
    #[arg(long)]
    alignment: Option<u64>,
    #[arg(long)]
    extent_policy: Option<CliExtentPolicy>,
}

impl ImageArgs {
    fn kind(&self) -> ImageKind {
        if self.cube {
            ImageKind::Cube
        } else if self.depth > 1 {
            ImageKind::D3
        } else if self.layers > 1 {
            ImageKind::D2Array
        } else {
            ImageKind::D2
        }
    }

    fn extent(&self) -> Extent {
        Extent::new_3d(self.width, self.height, self.depth)
    }

    fn desc(&self) -> ImageDesc {
        let layers = if self.cube && self.layers == 1 {
            6
        } else {
            self.layers
        };
        let desc = ImageDesc::new(
            "probe image",
            self.kind(),
            self.format.into(),
            self.extent(),
        )
        .array_layers(layers)
        .usage(vk::ImageUsageFlags::TRANSFER_SRC);
        match self.levels {
            Some(levels) => desc.mip_levels(levels),
            None => desc.full_mip_chain(),
        }
    }

    fn transfer_config(&self, file: &FileConfig) -> TransferConfig {
        file.transfer_config(self.alignment, self.extent_policy)
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "mipstage", "mipstage-probe");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();

        tracing::debug!("log_file_path: {}", log_file_path.display());
        tracing::debug!("cli_args: {:#?}", cli_args);
    }

    let file_config = FileConfig::load(cli_args.config.as_deref())?;

    match &cli_args.command {
        Command::Layout(args) => print_layout(args, &args.transfer_config(&file_config)),
        Command::Upload(args) => upload(&cli_args, args, &file_config),
    }
}

fn print_layout(args: &ImageArgs, config: &TransferConfig) -> eyre::Result<()> {
    let desc = args.desc();
    desc.validate()?;
    let dimension: ImageDimension = desc.dimension();

    let chain = layout::describe_mip_chain(
        desc.extent,
        dimension,
        desc.format,
        desc.mip_levels,
        config.offset_alignment,
    )?;
    let packed = layout::image_layout(
        desc.extent,
        dimension,
        desc.format,
        desc.mip_levels,
        desc.array_layers,
        config.offset_alignment,
    )?;

    println!(
        "{:?} {:?} {}x{}x{}, {} levels x {} layers, alignment {}",
        desc.kind,
        desc.format,
        desc.extent.width,
        desc.extent.height,
        desc.extent.depth,
        desc.mip_levels,
        desc.array_layers,
        config.offset_alignment,
    );
    println!("level  extent            bytes      offset");
    for level in &chain {
        println!(
            "{:>5}  {:>5}x{:<5}x{:<4} {:>10} {:>10}",
            level.level,
            level.extent.width,
            level.extent.height,
            level.extent.depth,
            level.byte_size,
            level.offset,
        );
    }
    println!("total staging size: {} bytes", packed.total_size);

    println!("copy regions ({:?}):", config.extent_policy);
    let regions = layout::setup_copy_regions(
        &packed,
        desc.extent,
        dimension,
        layout::CopyLayout::default(),
        config.extent_policy,
        desc.format,
    );
    for region in &regions {
        println!(
            "  layer {:>3} level {:>2}  offset {:>10}  {}x{}x{}",
            region.base_array_layer,
            region.mip_level,
            region.buffer_offset,
            region.image_extent.width,
            region.image_extent.height,
            region.image_extent.depth,
        );
    }
    Ok(())
}

/// Deterministic bytes for one subresource.
fn pattern(index: usize, size: usize) -> Vec<u8> {
    let seed = (index as u32 + 1).wrapping_mul(0x9E37_79B9);
    let words: Vec<u32> = (0..size.div_ceil(4) as u32)
        .map(|i| seed ^ i.wrapping_mul(0x85EB_CA6B))
        .collect();
    bytemuck::cast_slice::<u32, u8>(&words)[..size].to_vec()
}

fn upload(cli_args: &CliArgs, args: &ImageArgs, file: &FileConfig) -> eyre::Result<()> {
    let transfer_config = args.transfer_config(file);
    let device_config = file.device_config(cli_args.queue_mode);

    // SAFETY: The Vulkan loader is loaded once here and outlives every object
    // created from it; nothing else in the process touches it.
    let instance = Arc::new(unsafe {
        Instance::new(
            "mipstage-probe",
            cli_args.graphics_debug_level.map(Into::into),
        )
    }?);
    let device = Arc::new(Device::create_headless(&instance, device_config)?);
    let allocator = Arc::new(PooledAllocator::new(&device));
    let mut recorder = TransferRecorder::new(&device)?;
    let mut resources = Resources::new(Arc::clone(&device), allocator);

    let desc = args.desc();
    let packed = layout::image_layout(
        desc.extent,
        desc.dimension(),
        desc.format,
        desc.mip_levels,
        desc.array_layers,
        transfer_config.offset_alignment,
    )?;
    let image = resources.create_image(desc)?;

    let data: Vec<Vec<u8>> = packed
        .ranges()
        .enumerate()
        .map(|(index, (_, size))| pattern(index, size as usize))
        .collect();
    let slices: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();

    let start = Instant::now();
    transfer::upload_image_data(
        &mut resources,
        &mut recorder,
        image,
        &slices,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        &transfer_config,
    )?;
    let uploaded = start.elapsed();

    let start = Instant::now();
    let read = transfer::read_image(&mut resources, &mut recorder, image, &transfer_config)?;
    let read_back = start.elapsed();

    let mismatched: Vec<usize> = data
        .iter()
        .zip(&read)
        .enumerate()
        .filter(|(_, (sent, got))| sent != got)
        .map(|(index, _)| index)
        .collect();
    eyre::ensure!(
        read.len() == data.len() && mismatched.is_empty(),
        "readback differs in subresources {mismatched:?} ({} of {} returned)",
        read.len(),
        data.len(),
    );

    println!(
        "uploaded {} bytes in {} subresources in {:?}, read back in {:?}: ok",
        packed.total_size,
        data.len(),
        uploaded,
        read_back,
    );
    Ok(())
}
