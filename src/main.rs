use clap::{Args, Parser, Subcommand};
use log::info;
use ortho_tile_detect::image_utils::tiling::{
    bytes_to_megabytes, calculate_grid_size, plan_windows,
};
use ortho_tile_detect::object_detection::object_detection_utils::read_classes_txt_file;
use ortho_tile_detect::object_detection::yolov11_bounding_box::Yolov11BoundingBox;
use ortho_tile_detect::pipeline::config::{PipelineConfig, StrategyKind};
use ortho_tile_detect::pipeline::run::run_pipeline;
use ortho_tile_detect::pipeline::FailurePolicy;
use ortho_tile_detect::raster::geotiff::GeoTiffReader;
use ortho_tile_detect::raster::mosaic::{collect_tile_paths, merge_rasters};
use ortho_tile_detect::raster::tiler::split_tif_to_tif;
use ortho_tile_detect::vector::geometry::CoordinateSpace;
use std::error::Error;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ortho-tile-detect")]
#[command(about = "Tile a GeoTIFF orthomosaic, detect objects per tile and merge the results")]
#[command(version)]
#[command(after_help = "Sources must be 8-bit gray, RGB or RGBA GeoTIFFs with interleaved samples; \
16-bit and floating point rasters have to be converted first.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tiling, detection, overlap resolution and merging.
    Run(RunArgs),

    /// Only cut the source raster into georeferenced tiles.
    Tile {
        /// Source GeoTIFF.
        source: PathBuf,
        /// Directory the tiles are written to.
        #[arg(long, default_value = "output/tiles")]
        output_dir: PathBuf,
        /// Stop at the first tile that cannot be written.
        #[arg(long)]
        fail_fast: bool,
    },

    /// Mosaic the `tile_{row}_{col}.tif` files of a directory into one GeoTIFF.
    Merge {
        /// Directory holding the tiles.
        tiles_dir: PathBuf,
        /// Mosaic to write.
        #[arg(long, default_value = "output/mosaic.tif")]
        output: PathBuf,
    },

    /// Print the grid a source raster would be cut into.
    Grid {
        /// Source GeoTIFF.
        source: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Source GeoTIFF. Required unless given in --config.
    source: Option<PathBuf>,

    /// JSON pipeline configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// YOLOv11 ONNX model.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Class names, one per line.
    #[arg(long)]
    classes: Option<PathBuf>,

    /// Worker threads running detection.
    #[arg(long)]
    threads: Option<usize>,

    /// Minimum detector confidence.
    #[arg(long)]
    confidence: Option<f32>,

    /// NMS IoU threshold.
    #[arg(long)]
    iou_threshold: Option<f32>,

    /// Detections scoring below this are dropped before NMS.
    #[arg(long)]
    score_threshold: Option<f32>,

    /// Only suppress detections of the same class.
    #[arg(long)]
    class_aware: bool,

    /// Overlap resolution strategy.
    #[arg(long, value_enum)]
    strategy: Option<StrategyKind>,

    /// CRS label written to the vector outputs.
    #[arg(long)]
    crs: Option<String>,

    /// Coordinate space of the detection polygons.
    #[arg(long, value_enum)]
    space: Option<CoordinateSpace>,

    /// Abort at the first failing tile.
    #[arg(long)]
    fail_fast: bool,

    /// Do not write the raster mosaic.
    #[arg(long)]
    skip_mosaic: bool,

    /// Delete the tile directory once the run succeeds.
    #[arg(long)]
    discard_tiles: bool,
}

impl RunArgs {
    fn into_config(self) -> Result<PipelineConfig, Box<dyn Error>> {
        let mut config = match (&self.config, &self.source) {
            (Some(path), _) => PipelineConfig::load_json(path)?,
            (None, Some(source)) => PipelineConfig::new(source),
            (None, None) => return Err("a source raster or --config is required".into()),
        };
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(model) = self.model {
            config.model_path = Some(model);
        }
        if let Some(classes) = self.classes {
            config.classes_path = Some(classes);
        }
        if let Some(threads) = self.threads {
            config.num_threads = threads;
        }
        if let Some(confidence) = self.confidence {
            config.confidence = confidence;
        }
        if let Some(iou_threshold) = self.iou_threshold {
            config.iou_threshold = iou_threshold;
        }
        if let Some(score_threshold) = self.score_threshold {
            config.score_threshold = score_threshold;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(space) = self.space {
            config.coordinate_space = space;
        }
        if self.crs.is_some() {
            config.crs = self.crs;
        }
        config.class_aware_nms |= self.class_aware;
        config.fail_fast |= self.fail_fast;
        config.skip_mosaic |= self.skip_mosaic;
        config.keep_tiles &= !self.discard_tiles;
        Ok(config)
    }
}

fn existing_path<'a>(path: Option<&'a PathBuf>, what: &str) -> Result<&'a Path, Box<dyn Error>> {
    let Some(path) = path else {
        return Err(format!("No {what} path given").into());
    };
    if !path.exists() {
        return Err(format!("{what} path does not exist, or cannot be read: {path:?}").into());
    }
    Ok(path.as_path())
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let config = args.into_config()?;
    config.validate()?;
    let model_path = existing_path(config.model_path.as_ref(), "Model")?;
    let classes_path = existing_path(config.classes_path.as_ref(), "Classes")?;
    let model = Yolov11BoundingBox::new(
        model_path,
        read_classes_txt_file(classes_path)?,
        config.input_width,
        config.input_height,
        "yolov11 onnx".to_string(),
    )?;
    info!("Loaded {} from {model_path:?}", model.model_name());

    let output = run_pipeline(&config, &model)?;
    println!(
        "{} tiles ({} grid), {} detections -> {:?}",
        output.tiles.len(),
        output.grid,
        output.detections.len(),
        output.detections_path
    );
    if let Some(mosaic) = &output.mosaic {
        println!(
            "Mosaic {}x{} ({} bands) -> {:?}",
            mosaic.width, mosaic.height, mosaic.bands, mosaic.path
        );
    }
    if !output.report.is_clean() {
        println!(
            "{} tile failures, see {:?}",
            output.report.failures.len(),
            output.report_path
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Cli::parse().command {
        Commands::Run(args) => run(args)?,
        Commands::Tile {
            source,
            output_dir,
            fail_fast,
        } => {
            let policy = if fail_fast {
                FailurePolicy::FailFast
            } else {
                FailurePolicy::BestEffort
            };
            let outcome = split_tif_to_tif(&source, &output_dir, policy)?;
            println!(
                "Wrote {} tiles ({} grid) to {output_dir:?}, {} failed",
                outcome.tiles.len(),
                outcome.grid,
                outcome.failures.len()
            );
        }
        Commands::Merge { tiles_dir, output } => {
            let tile_paths = collect_tile_paths(&tiles_dir)?;
            let mosaic = merge_rasters(&tile_paths, &output)?;
            println!(
                "Merged {} tiles into {}x{} mosaic {:?}",
                mosaic.tiles, mosaic.width, mosaic.height, mosaic.path
            );
        }
        Commands::Grid { source } => {
            let reader = GeoTiffReader::open(&source)?;
            let profile = reader.profile();
            let file_size_mb = bytes_to_megabytes(reader.byte_size());
            let grid = calculate_grid_size(file_size_mb);
            let windows = plan_windows(profile.width, profile.height, grid);
            println!(
                "{source:?}: {}x{} px, {file_size_mb:.2} MB -> {grid} grid, {} tiles",
                profile.width,
                profile.height,
                windows.len()
            );
        }
    }
    Ok(())
}
