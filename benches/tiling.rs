use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use autotile::common::{Dtype, Shape};
use autotile::dispatch::{do_auto_tiling, TilingCache};
use autotile::serialize::RunInfo;
use autotile::shape;
use autotile::tensorspec::{OpDesc, TensorDesc};

const BROADCAST_INFO: &str = r#"{
    "_pattern": "Broadcast",
    "base_info": {"000": [32, 2, 43680, 21840]},
    "elewise_vars": {
        "210000000": [10000, 20000, 30000],
        "210010000": [10000, 20000, 30000],
        "200000000": [10000, 10001, 10100, 10101, 20000, 30000],
        "200000001": [10000, 10001, 10100, 10101, 20000, 30000],
        "200010001": [10000, 10001, 10100, 10101, 20000, 30000]
    }
}"#;

const REDUCE_INFO: &str = r#"{
    "_pattern": "CommReduce",
    "core_num": 32,
    "axes": [-1],
    "patterns": {
        "AR": {
            "max_ub_count": 16384,
            "tiling_keys": [
                {"block_axis": 0, "ub_axis": 0, "key": 100, "vars": [10000, 10001, 20000, 30000]},
                {"block_axis": 0, "ub_axis": 1, "key": 101, "vars": [10000, 10001, 20000, 30000]}
            ]
        }
    }
}"#;

const TRANSPOSE_INFO: &str = r#"{
    "_pattern": "Transpose",
    "core_num": 32,
    "ub_size": 262144,
    "permute": [0, 2, 1, 3]
}"#;

fn op(op_type: &str, inputs: &[Shape]) -> OpDesc {
    OpDesc::new(
        op_type,
        inputs
            .iter()
            .map(|s| TensorDesc::new(s.clone(), Dtype::Float16))
            .collect(),
        vec![],
    )
}

#[export_name = "autotile_bench_tiling::warm_cache"]
fn warm_cache(op: &OpDesc, compile_info: &str) -> TilingCache {
    let mut cache = TilingCache::new();
    cache.handler(&op.op_type, compile_info).unwrap();
    cache
}

fn tile_many(op: &OpDesc, compile_info: &str) {
    let mut cache = warm_cache(op, compile_info);
    for _ in 0..100 {
        let mut run_info = RunInfo::default();
        black_box(do_auto_tiling(&mut cache, op, compile_info, &mut run_info));
        black_box(run_info);
    }
}

#[library_benchmark]
fn tile_broadcast() {
    let op = op("Add", &[shape![64, 1, 4096], shape![64, 128, 4096]]);
    tile_many(&op, BROADCAST_INFO);
}

#[library_benchmark]
fn tile_reduce() {
    let op = op("ReduceSum", &[shape![1024, 4096]]);
    tile_many(&op, REDUCE_INFO);
}

#[library_benchmark]
fn tile_transpose() {
    let op = op("Transpose", &[shape![8, 128, 512, 64]]);
    tile_many(&op, TRANSPOSE_INFO);
}

library_benchmark_group!(
    name = tiling_group;
    benchmarks =
        tile_broadcast,
        tile_reduce,
        tile_transpose
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "toggle-collect=autotile_bench_tiling::warm_cache",
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = tiling_group
);
