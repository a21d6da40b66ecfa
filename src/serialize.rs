//! Tiling data: the positional parameter blob read by the kernel template.
//!
//! Fields are recorded through a [TilingDataWriter], which refuses to commit unless the
//! number of recorded fields matches what the compile-info variable list declared. Nothing
//! reaches a [RunInfo] until that check passes.

use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

use crate::compile_info::ConfigError;
use crate::tiling::{to_i32, TilingError};
use crate::utils::join_into_string;

/// Every slot in the tiling data is this many bytes wide.
pub const SLOT_BYTES: usize = 4;

const DIM_BASE: u32 = 10000;
const BLOCK_FACTOR_ID: u32 = 20000;
const UB_FACTOR_BASE: u32 = 30000;
const REDUCE_MEAN_COF_ID: u32 = 40000;
const MAX_UB_FACTORS: u32 = 10;

/// A variable a kernel template can ask for, as encoded in compile info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum VarId {
    /// A dimension of a (possibly fused) input: `10000 + input * 100 + axis`.
    Dim { input: u8, axis: u8 },
    BlockFactor,
    /// `30000 + n`.
    UbFactor(u8),
    ReduceMeanCof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    I32(i32),
    F32(f32),
    /// Occupies the low half of a full slot.
    F16(half::f16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TilingField {
    pub name: String,
    pub value: FieldValue,
}

/// What the tiling entry points hand back to the kernel launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub block_dim: u32,
    pub tiling_key: i64,
    pub tiling_data: Vec<u8>,
    #[serde(skip)]
    pub field_names: Vec<String>,
}

#[derive(Debug, Default)]
pub struct TilingDataWriter {
    fields: Vec<TilingField>,
    expected: usize,
}

impl VarId {
    pub fn encode(self) -> u32 {
        match self {
            VarId::Dim { input, axis } => DIM_BASE + u32::from(input) * 100 + u32::from(axis),
            VarId::BlockFactor => BLOCK_FACTOR_ID,
            VarId::UbFactor(n) => UB_FACTOR_BASE + u32::from(n),
            VarId::ReduceMeanCof => REDUCE_MEAN_COF_ID,
        }
    }
}

impl TryFrom<u32> for VarId {
    type Error = ConfigError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            BLOCK_FACTOR_ID => Ok(VarId::BlockFactor),
            REDUCE_MEAN_COF_ID => Ok(VarId::ReduceMeanCof),
            _ if (DIM_BASE..BLOCK_FACTOR_ID).contains(&id) => {
                let offset = id - DIM_BASE;
                Ok(VarId::Dim {
                    input: (offset / 100) as u8,
                    axis: (offset % 100) as u8,
                })
            }
            _ if (UB_FACTOR_BASE..UB_FACTOR_BASE + MAX_UB_FACTORS).contains(&id) => {
                Ok(VarId::UbFactor((id - UB_FACTOR_BASE) as u8))
            }
            _ => Err(ConfigError::UnknownVarId(id)),
        }
    }
}

impl From<VarId> for u32 {
    fn from(v: VarId) -> Self {
        v.encode()
    }
}

impl Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarId::Dim { input, axis } => write!(f, "dim_{input}_{axis}"),
            VarId::BlockFactor => write!(f, "block_factor"),
            VarId::UbFactor(0) => write!(f, "ub_factor"),
            VarId::UbFactor(n) => write!(f, "ub_factor_{n}"),
            VarId::ReduceMeanCof => write!(f, "reduce_mean_cof"),
        }
    }
}

impl FieldValue {
    fn write_slot(&self, out: &mut Vec<u8>) {
        match self {
            FieldValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            FieldValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            FieldValue::F16(v) => {
                out.extend_from_slice(&v.to_le_bytes());
                out.extend_from_slice(&[0; SLOT_BYTES - 2]);
            }
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::I32(v) => write!(f, "{v}"),
            FieldValue::F32(v) => write!(f, "{v}"),
            FieldValue::F16(v) => write!(f, "{v}"),
        }
    }
}

impl TilingDataWriter {
    /// A writer that will commit exactly `expected` fields.
    pub fn expecting(expected: usize) -> Self {
        TilingDataWriter {
            fields: Vec::with_capacity(expected),
            expected,
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push(TilingField {
            name: name.into(),
            value,
        });
    }

    /// Records an integer, failing if it does not fit a 4-byte slot.
    pub fn push_i64(&mut self, name: impl Into<String>, value: i64) -> Result<(), TilingError> {
        self.push(name, FieldValue::I32(to_i32(value)?));
        Ok(())
    }

    pub fn push_flag(&mut self, name: impl Into<String>, value: bool) {
        self.push(name, FieldValue::I32(i32::from(value)));
    }

    /// Records one field per entry of `vars`, in order, resolving each through `resolve`.
    pub fn write_vars<F>(&mut self, vars: &[VarId], mut resolve: F) -> Result<(), TilingError>
    where
        F: FnMut(VarId) -> Result<FieldValue, TilingError>,
    {
        for &var in vars {
            let value = resolve(var)?;
            self.push(var.to_string(), value);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[TilingField] {
        &self.fields
    }

    /// Writes the recorded fields, `block_dim`, and `tiling_key` into `run_info`.
    ///
    /// `run_info` is left untouched if the field count does not match.
    pub fn commit(
        self,
        block_dim: u32,
        tiling_key: i64,
        run_info: &mut RunInfo,
    ) -> Result<(), TilingError> {
        if self.fields.len() != self.expected {
            return Err(TilingError::FieldCountMismatch {
                expected: self.expected,
                actual: self.fields.len(),
            });
        }
        let mut data = Vec::with_capacity(self.fields.len() * SLOT_BYTES);
        for field in &self.fields {
            field.value.write_slot(&mut data);
        }
        run_info.block_dim = block_dim;
        run_info.tiling_key = tiling_key;
        run_info.tiling_data = data;
        run_info.field_names = self.fields.into_iter().map(|f| f.name).collect();
        Ok(())
    }
}

impl RunInfo {
    /// The tiling data read back as 4-byte signed integers.
    pub fn data_as_i32(&self) -> Vec<i32> {
        self.tiling_data
            .chunks_exact(SLOT_BYTES)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl Display for RunInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block_dim={} tiling_key={} data=[{}]",
            self.block_dim,
            self.tiling_key,
            join_into_string(self.data_as_i32(), ", ")
        )
    }
}
