use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use log::info;
use prettytable::{format, row};
use std::path;

use autotile::common::{DimSize, Dtype, Shape};
use autotile::dispatch::{AutoTiling, ShapeOverride, TilingCache};
use autotile::serialize::RunInfo;
use autotile::tensorspec::{OpDesc, TensorDesc};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the operator's compile-info JSON
    compile_info: path::PathBuf,

    /// An input shape, e.g. `1024,4096`; repeat for each input
    #[arg(long = "input", short, required = true, value_parser = parse_shape)]
    inputs: Vec<Shape>,

    /// An output shape; defaults to none
    #[arg(long = "output", short, value_parser = parse_shape)]
    outputs: Vec<Shape>,

    #[arg(long, default_value = "float16")]
    dtype: Dtype,

    /// Output dtype; defaults to the input dtype
    #[arg(long)]
    out_dtype: Option<Dtype>,

    /// Reduce axes, overriding the ones in the compile info
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    axes: Option<Vec<i64>>,

    #[arg(long, default_value = "Op")]
    op_type: String,

    /// Print the run info as JSON instead of a table
    #[arg(long)]
    json: bool,
}

fn parse_shape(s: &str) -> Result<Shape, String> {
    s.split(',')
        .map(|d| {
            d.trim()
                .parse::<DimSize>()
                .map_err(|e| format!("bad dimension {d:?}: {e}"))
        })
        .collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let compile_info = std::fs::read_to_string(&args.compile_info)
        .with_context(|| format!("reading {}", args.compile_info.display()))?;
    let out_dtype = args.out_dtype.unwrap_or(args.dtype);
    let op = OpDesc::new(
        args.op_type.clone(),
        args.inputs
            .iter()
            .map(|s| TensorDesc::new(s.clone(), args.dtype))
            .collect(),
        args.outputs
            .iter()
            .map(|s| TensorDesc::new(s.clone(), out_dtype))
            .collect(),
    );

    let mut cache = TilingCache::new();
    let handler = cache.handler(&op.op_type, &compile_info)?;
    let mut run_info = RunInfo::default();
    match &args.axes {
        Some(axes) => {
            let shapes = ShapeOverride {
                input_shapes: args.inputs.clone(),
                reduce_axes: Some(axes.clone()),
            };
            handler.do_tiling_with_shapes(&op, &shapes, &mut run_info)
        }
        None => handler.do_tiling(&op, &mut run_info),
    }
    .with_context(|| format!("tiling {op}"))?;
    info!("Tiled {}: {}", op, run_info);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run_info)?);
        return Ok(());
    }

    let mut table = prettytable::Table::new();
    table.set_titles(row!["Field", "Value"]);
    table.add_row(row!["block_dim", run_info.block_dim]);
    table.add_row(row!["tiling_key", run_info.tiling_key]);
    for (name, value) in run_info.field_names.iter().zip_eq(run_info.data_as_i32()) {
        table.add_row(row![name, value]);
    }
    table.set_format(
        format::FormatBuilder::new()
            .separator(
                format::LinePosition::Title,
                format::LineSeparator::new('-', ' ', ' ', ' '),
            )
            .column_separator(' ')
            .build(),
    );
    table.printstd();
    Ok(())
}
