//! The parsed, validated view of the ahead-of-time constants that accompany an operator.
//!
//! Compile info arrives as JSON. [CompileInfo::from_json_str] parses it in two phases: the
//! `_pattern` tag is read first and then selects which typed schema the rest of the document
//! must satisfy. Every table is checked here so the tiling algorithms never see a malformed
//! value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use crate::common::{DimSize, Dtype, Shape};
use crate::serialize::VarId;
use crate::utils::join_into_string;

/// Largest rank a transpose may have after axis merging.
pub const MAX_TRANSPOSE_RANK: usize = 8;

const PATTERN_FIELD: &str = "_pattern";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::EnumString,
    strum::Display,
)]
pub enum Pattern {
    ElemWise,
    Broadcast,
    CommReduce,
    Norm,
    Transpose,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Malformed compile info: {0}")]
    Json(String),
    #[error("Could not read compile info: {0}")]
    Io(String),
    #[error("Compile info has no {PATTERN_FIELD} tag")]
    MissingPattern,
    #[error("Unknown pattern: {0}")]
    UnknownPattern(String),
    #[error("{field} must be positive; got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("base_info entry {key} must have 4 elements; got {len}")]
    BaseInfoLength { key: String, len: usize },
    #[error("{table} key {key:?} is not an integer")]
    BadKey { table: &'static str, key: String },
    #[error("{field} has {actual} entries; expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("permute [{0}] is not a permutation")]
    InvalidPermutation(String),
    #[error("Axis {axis} is marked mergeable but does not stay adjacent to its predecessor")]
    InconsistentMerge { axis: usize },
    #[error("Merged rank {0} exceeds the supported maximum")]
    RankTooLarge(usize),
    #[error("Unknown tiling variable id {0}")]
    UnknownVarId(u32),
    #[error("reduce_mean_cof_dtype must be float32 or float16; got {0}")]
    CofDtype(Dtype),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e.to_string())
    }
}

/// Compile info for one operator instance.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileInfo {
    ElemWise(ElementwiseInfo),
    Broadcast(ElementwiseInfo),
    CommReduce(ReduceInfo),
    Norm(NormInfo),
    Transpose(TransposeInfo),
}

/// Per-pattern-code hardware numbers for elementwise tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BaseInfo {
    pub core_num: u32,
    pub max_dtype_bytes: u8,
    /// In elements of the widest dtype.
    pub max_available_ub: i64,
    pub max_available_ub_db: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementwiseInfo {
    pub only_const_tiling: bool,
    pub is_const_shapes: bool,
    pub use_special_pattern: bool,
    pub is_unknown_rank: bool,
    pub base_info: BTreeMap<u32, BaseInfo>,
    pub elewise_vars: BTreeMap<i64, Vec<VarId>>,
    /// For each constant case, the padded shape of every input.
    pub const_shapes: Vec<Vec<Shape>>,
    pub const_block_dims: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyEntry {
    pub block_axis: usize,
    pub ub_axis: usize,
    /// Second UB axis, used only by keys of the single-core default strategy.
    #[serde(default)]
    pub out_ub_axis: Option<usize>,
    pub key: i64,
    #[serde(default)]
    pub vars: Vec<VarId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReducePatternInfo {
    /// Input elements that fit in UB at once.
    pub max_ub_count: i64,
    #[serde(default)]
    pub tiling_keys: Vec<KeyEntry>,
    #[serde(default)]
    pub atomic_keys: Vec<KeyEntry>,
    #[serde(default)]
    pub default_keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReduceInfo {
    pub core_num: u32,
    #[serde(default)]
    pub keep_dims: bool,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub reduce_mean_cof_dtype: Option<Dtype>,
    /// Reduce axes of the original input; may be negative.
    #[serde(default)]
    pub axes: Vec<i64>,
    /// Keyed by fused layout string, e.g. `"AR"` or `"ARA"`.
    pub patterns: BTreeMap<String, ReducePatternInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NormInfo {
    pub core_num: u32,
    pub max_ub_count: i64,
    pub reduce_axes: Vec<i64>,
    pub tiling_keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransposeInfo {
    pub core_num: u32,
    /// In bytes.
    pub ub_size: i64,
    pub permute: Vec<usize>,
    pub mergeable: Vec<bool>,
    pub transpose_vars: Vec<bool>,
    pub is_const: bool,
    pub const_block_dims: u32,
    #[serde(skip)]
    merge_groups: Vec<(usize, usize)>,
    #[serde(skip)]
    merged_permute: Vec<usize>,
}

#[derive(Deserialize)]
struct ElementwiseJson {
    #[serde(default)]
    only_const_tiling: bool,
    #[serde(default)]
    is_const_shapes: bool,
    #[serde(default)]
    use_special_pattern: bool,
    #[serde(default)]
    is_unknown_rank: bool,
    #[serde(default)]
    base_info: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    elewise_vars: BTreeMap<String, Vec<VarId>>,
    #[serde(default)]
    const_shapes: Vec<Vec<Vec<DimSize>>>,
    #[serde(default)]
    const_block_dims: Vec<u32>,
}

#[derive(Deserialize)]
struct TransposeJson {
    core_num: u32,
    ub_size: i64,
    permute: Vec<usize>,
    #[serde(default)]
    mergeable: Vec<bool>,
    #[serde(default)]
    transpose_vars: Option<Vec<bool>>,
    #[serde(default)]
    is_const: bool,
    #[serde(default)]
    const_block_dims: u32,
}

impl Pattern {
    /// Reads the pattern tag of a compile-info document.
    pub fn of(value: &Value) -> Result<Self, ConfigError> {
        let tag = value
            .get(PATTERN_FIELD)
            .and_then(Value::as_str)
            .ok_or(ConfigError::MissingPattern)?;
        Pattern::from_str(tag).map_err(|_| ConfigError::UnknownPattern(tag.to_string()))
    }
}

impl CompileInfo {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(json)?;
        let pattern = Pattern::of(&value)?;
        Self::from_value(pattern, value)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Parses `value` against the schema of `pattern`.
    pub fn from_value(pattern: Pattern, value: Value) -> Result<Self, ConfigError> {
        Ok(match pattern {
            Pattern::ElemWise => {
                CompileInfo::ElemWise(serde_json::from_value::<ElementwiseJson>(value)?.try_into()?)
            }
            Pattern::Broadcast => {
                CompileInfo::Broadcast(serde_json::from_value::<ElementwiseJson>(value)?.try_into()?)
            }
            Pattern::CommReduce => {
                let info: ReduceInfo = serde_json::from_value(value)?;
                info.validate()?;
                CompileInfo::CommReduce(info)
            }
            Pattern::Norm => {
                let info: NormInfo = serde_json::from_value(value)?;
                positive("core_num", info.core_num.into())?;
                positive("max_ub_count", info.max_ub_count)?;
                CompileInfo::Norm(info)
            }
            Pattern::Transpose => {
                CompileInfo::Transpose(serde_json::from_value::<TransposeJson>(value)?.try_into()?)
            }
        })
    }

    pub fn pattern(&self) -> Pattern {
        match self {
            CompileInfo::ElemWise(_) => Pattern::ElemWise,
            CompileInfo::Broadcast(_) => Pattern::Broadcast,
            CompileInfo::CommReduce(_) => Pattern::CommReduce,
            CompileInfo::Norm(_) => Pattern::Norm,
            CompileInfo::Transpose(_) => Pattern::Transpose,
        }
    }

    pub fn core_num(&self) -> u32 {
        match self {
            CompileInfo::ElemWise(i) | CompileInfo::Broadcast(i) => i
                .base_info
                .values()
                .map(|b| b.core_num)
                .max()
                .unwrap_or(1),
            CompileInfo::CommReduce(i) => i.core_num,
            CompileInfo::Norm(i) => i.core_num,
            CompileInfo::Transpose(i) => i.core_num,
        }
    }
}

impl ElementwiseInfo {
    /// The base info for `code`, falling back to the `ORIGINAL` (0) entry.
    pub fn base_info_for(&self, code: u32) -> Option<&BaseInfo> {
        self.base_info.get(&code).or_else(|| self.base_info.get(&0))
    }
}

impl TryFrom<ElementwiseJson> for ElementwiseInfo {
    type Error = ConfigError;

    fn try_from(raw: ElementwiseJson) -> Result<Self, Self::Error> {
        let mut base_info = BTreeMap::new();
        for (key, values) in raw.base_info {
            let code = parse_key::<u32>("base_info", &key)?;
            let [core_num, max_dtype_bytes, max_available_ub, max_available_ub_db] =
                <[i64; 4]>::try_from(values.as_slice()).map_err(|_| ConfigError::BaseInfoLength {
                    key: key.clone(),
                    len: values.len(),
                })?;
            positive("core_num", core_num)?;
            positive("max_dtype_bytes", max_dtype_bytes)?;
            positive("max_available_ub", max_available_ub)?;
            positive("max_available_ub_db", max_available_ub_db)?;
            base_info.insert(
                code,
                BaseInfo {
                    core_num: u32::try_from(core_num).map_err(|_| ConfigError::NonPositive {
                        field: "core_num",
                        value: core_num,
                    })?,
                    max_dtype_bytes: u8::try_from(max_dtype_bytes).map_err(|_| {
                        ConfigError::NonPositive {
                            field: "max_dtype_bytes",
                            value: max_dtype_bytes,
                        }
                    })?,
                    max_available_ub,
                    max_available_ub_db,
                },
            );
        }

        let elewise_vars = raw
            .elewise_vars
            .into_iter()
            .map(|(key, vars)| Ok((parse_key::<i64>("elewise_vars", &key)?, vars)))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        if raw.is_const_shapes && raw.const_shapes.len() != raw.const_block_dims.len() {
            return Err(ConfigError::LengthMismatch {
                field: "const_block_dims",
                expected: raw.const_shapes.len(),
                actual: raw.const_block_dims.len(),
            });
        }
        let const_shapes = raw
            .const_shapes
            .into_iter()
            .map(|case| case.into_iter().map(SmallVec::from_vec).collect())
            .collect();

        Ok(ElementwiseInfo {
            only_const_tiling: raw.only_const_tiling,
            is_const_shapes: raw.is_const_shapes,
            use_special_pattern: raw.use_special_pattern,
            is_unknown_rank: raw.is_unknown_rank,
            base_info,
            elewise_vars,
            const_shapes,
            const_block_dims: raw.const_block_dims,
        })
    }
}

impl ReduceInfo {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("core_num", self.core_num.into())?;
        for p in self.patterns.values() {
            positive("max_ub_count", p.max_ub_count)?;
        }
        match self.reduce_mean_cof_dtype {
            None | Some(Dtype::Float32) | Some(Dtype::Float16) => Ok(()),
            Some(d) => Err(ConfigError::CofDtype(d)),
        }
    }
}

impl TransposeInfo {
    /// Ranges `[start, end)` of original axes that collapse into each merged axis.
    pub fn merge_groups(&self) -> &[(usize, usize)] {
        &self.merge_groups
    }

    /// The permutation over merged axes.
    pub fn merged_permute(&self) -> &[usize] {
        &self.merged_permute
    }

    /// Collapses `shape` according to the merge groups.
    pub fn merge_shape(&self, shape: &[DimSize]) -> Option<Shape> {
        if shape.len() != self.permute.len() {
            return None;
        }
        self.merge_groups
            .iter()
            .map(|&(start, end)| {
                shape[start..end]
                    .iter()
                    .try_fold(1i64, |acc, &d| acc.checked_mul(d))
            })
            .collect()
    }
}

impl TryFrom<TransposeJson> for TransposeInfo {
    type Error = ConfigError;

    fn try_from(raw: TransposeJson) -> Result<Self, Self::Error> {
        positive("core_num", raw.core_num.into())?;
        positive("ub_size", raw.ub_size)?;

        let rank = raw.permute.len();
        let mut seen = vec![false; rank];
        for &p in &raw.permute {
            if p >= rank || seen[p] {
                return Err(ConfigError::InvalidPermutation(join_into_string(
                    &raw.permute,
                    ", ",
                )));
            }
            seen[p] = true;
        }

        let mergeable = if raw.mergeable.is_empty() {
            vec![false; rank]
        } else {
            raw.mergeable
        };
        if mergeable.len() != rank {
            return Err(ConfigError::LengthMismatch {
                field: "mergeable",
                expected: rank,
                actual: mergeable.len(),
            });
        }

        // Output position of every input axis.
        let mut position = vec![0; rank];
        for (p, &axis) in raw.permute.iter().enumerate() {
            position[axis] = p;
        }

        let mut merge_groups: Vec<(usize, usize)> = Vec::with_capacity(rank);
        let mut group_of = vec![0; rank];
        for axis in 0..rank {
            match merge_groups.last_mut() {
                Some(last) if mergeable[axis] => {
                    if position[axis] != position[axis - 1] + 1 {
                        return Err(ConfigError::InconsistentMerge { axis });
                    }
                    last.1 = axis + 1;
                }
                _ => merge_groups.push((axis, axis + 1)),
            }
            group_of[axis] = merge_groups.len() - 1;
        }
        if merge_groups.len() > MAX_TRANSPOSE_RANK {
            return Err(ConfigError::RankTooLarge(merge_groups.len()));
        }

        let merged_permute = raw
            .permute
            .iter()
            .filter(|&&axis| merge_groups[group_of[axis]].0 == axis)
            .map(|&axis| group_of[axis])
            .collect::<Vec<_>>();

        let transpose_vars = raw
            .transpose_vars
            .unwrap_or_else(|| vec![true; merge_groups.len()]);
        if transpose_vars.len() != merge_groups.len() {
            return Err(ConfigError::LengthMismatch {
                field: "transpose_vars",
                expected: merge_groups.len(),
                actual: transpose_vars.len(),
            });
        }

        Ok(TransposeInfo {
            core_num: raw.core_num,
            ub_size: raw.ub_size,
            permute: raw.permute,
            mergeable,
            transpose_vars,
            is_const: raw.is_const,
            const_block_dims: raw.const_block_dims,
            merge_groups,
            merged_permute,
        })
    }
}

fn positive(field: &'static str, value: i64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

fn parse_key<T: FromStr>(table: &'static str, key: &str) -> Result<T, ConfigError> {
    key.parse().map_err(|_| ConfigError::BadKey {
        table,
        key: key.to_string(),
    })
}

impl Display for BaseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cores={} max_dtype={}B ub={} ub_db={}",
            self.core_num, self.max_dtype_bytes, self.max_available_ub, self.max_available_ub_db
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ELEMWISE: &str = r#"{
        "_pattern": "ElemWise",
        "base_info": {"100": [32, 2, 43680, 21840]},
        "elewise_vars": {"210000000": [10000, 20000, 30000]}
    }"#;

    #[test]
    fn test_parses_elementwise() {
        let CompileInfo::ElemWise(info) = CompileInfo::from_json_str(ELEMWISE).unwrap() else {
            panic!("expected elementwise compile info");
        };
        assert_eq!(
            info.base_info[&100],
            BaseInfo {
                core_num: 32,
                max_dtype_bytes: 2,
                max_available_ub: 43680,
                max_available_ub_db: 21840
            }
        );
        assert_eq!(
            info.elewise_vars[&210000000],
            vec![
                VarId::Dim { input: 0, axis: 0 },
                VarId::BlockFactor,
                VarId::UbFactor(0)
            ]
        );
        assert_eq!(info.base_info_for(121), None);
    }

    #[test]
    fn test_base_info_wrong_length() {
        let json = r#"{"_pattern": "Broadcast", "base_info": {"000": [32, 2, 43680]}}"#;
        assert_eq!(
            CompileInfo::from_json_str(json),
            Err(ConfigError::BaseInfoLength {
                key: "000".to_string(),
                len: 3
            })
        );
    }

    #[test]
    fn test_unknown_pattern_and_missing_tag() {
        assert_eq!(
            CompileInfo::from_json_str(r#"{"_pattern": "Gather"}"#),
            Err(ConfigError::UnknownPattern("Gather".to_string()))
        );
        assert_eq!(
            CompileInfo::from_json_str(r#"{"core_num": 32}"#),
            Err(ConfigError::MissingPattern)
        );
        assert!(matches!(
            CompileInfo::from_json_str("{not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_undecodable_var_id() {
        let json = r#"{"_pattern": "ElemWise", "elewise_vars": {"210000000": [55555]}}"#;
        assert!(matches!(
            CompileInfo::from_json_str(json),
            Err(ConfigError::Json(msg)) if msg.contains("55555")
        ));
    }

    #[test]
    fn test_transpose_merges_axes() {
        let json = r#"{
            "_pattern": "Transpose", "core_num": 32, "ub_size": 262144,
            "permute": [0, 1, 3, 2], "mergeable": [false, true, false, false]
        }"#;
        let CompileInfo::Transpose(info) = CompileInfo::from_json_str(json).unwrap() else {
            panic!("expected transpose compile info");
        };
        assert_eq!(info.merge_groups(), &[(0, 2), (2, 3), (3, 4)]);
        assert_eq!(info.merged_permute(), &[0, 2, 1]);
        assert_eq!(info.transpose_vars, vec![true; 3]);
        assert_eq!(info.merge_shape(&[2, 3, 4, 5]).unwrap().as_slice(), &[6, 4, 5]);
    }

    #[test]
    fn test_transpose_rejects_bad_permutation() {
        let json = r#"{"_pattern": "Transpose", "core_num": 32, "ub_size": 1024, "permute": [0, 0]}"#;
        assert_eq!(
            CompileInfo::from_json_str(json),
            Err(ConfigError::InvalidPermutation("0, 0".to_string()))
        );
        let json = r#"{"_pattern": "Transpose", "core_num": 32, "ub_size": 1024,
                       "permute": [1, 0], "mergeable": [false, true]}"#;
        assert_eq!(
            CompileInfo::from_json_str(json),
            Err(ConfigError::InconsistentMerge { axis: 1 })
        );
    }

    #[test]
    fn test_transpose_merged_rank_is_bounded() {
        let json = r#"{"_pattern": "Transpose", "core_num": 32, "ub_size": 1024,
                       "permute": [8, 7, 6, 5, 4, 3, 2, 1, 0]}"#;
        assert_eq!(
            CompileInfo::from_json_str(json),
            Err(ConfigError::RankTooLarge(9))
        );
        // Nine axes that merge down to two are fine.
        let json = r#"{"_pattern": "Transpose", "core_num": 32, "ub_size": 1024,
                       "permute": [0, 1, 2, 3, 4, 5, 6, 7, 8],
                       "mergeable": [false, true, true, true, true, true, true, true, false]}"#;
        assert!(CompileInfo::from_json_str(json).is_ok());
    }

    #[test]
    fn test_zero_core_num_rejected() {
        let json = r#"{"_pattern": "Norm", "core_num": 0, "max_ub_count": 1024,
                       "reduce_axes": [-1], "tiling_keys": []}"#;
        assert_eq!(
            CompileInfo::from_json_str(json),
            Err(ConfigError::NonPositive {
                field: "core_num",
                value: 0
            })
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ELEMWISE.as_bytes()).unwrap();
        let info = CompileInfo::load(file.path()).unwrap();
        assert_eq!(info.pattern(), Pattern::ElemWise);
        assert_eq!(info.core_num(), 32);
        assert!(matches!(
            CompileInfo::load("/nonexistent/compile_info.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
