//! Computation stages, the token tuples keying their rows, and the row shapes they persist.

use crate::error::CacheError;
use crate::token::{kind, Token, TokenKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::slice::ChunksExact;

/// Token tuple identifying one row of a stage.
///
/// Encoded as the big-endian concatenation of the token ids, so comparing encoded keys
/// byte by byte orders them like the tuples themselves.
pub trait StageKey: Copy + Debug + Eq + std::hash::Hash + Send + Sync + 'static {
    const WIDTH: usize;
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, CacheError>;
    /// `(kind table, token id)` for every component.
    fn references(&self) -> Vec<(&'static str, u32)>;
}

pub trait Stage: Send + Sync + 'static {
    const TABLE: &'static str;
    const INDEX: &'static str;
    type Key: StageKey;
    type Row: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;
}

fn next_id(chunks: &mut ChunksExact<'_, u8>) -> Result<u32, CacheError> {
    chunks
        .next()
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .ok_or_else(|| CacheError::database("stage key truncated"))
}

macro_rules! stage_key {
    ($(#[$meta:meta])* $name:ident { $($field:ident : $kind:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            $(pub $field: Token<kind::$kind>),+
        }

        impl StageKey for $name {
            const WIDTH: usize = 4 * [$(stringify!($field)),+].len();

            fn encode(&self) -> Vec<u8> {
                let mut out = Vec::with_capacity(Self::WIDTH);
                $(out.extend_from_slice(&self.$field.id().to_be_bytes());)+
                out
            }

            fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
                if bytes.len() != Self::WIDTH {
                    return Err(CacheError::database(format!(
                        "{} expects {} key bytes, got {}", stringify!($name), Self::WIDTH, bytes.len()
                    )));
                }
                let mut chunks = bytes.chunks_exact(4);
                Ok($name { $($field: Token::new(next_id(&mut chunks)?)),+ })
            }

            fn references(&self) -> Vec<(&'static str, u32)> {
                vec![$((<kind::$kind as TokenKind>::TABLE, self.$field.id())),+]
            }
        }
    };
}

macro_rules! stages {
    ($($stage:ident => $table:literal, $key:ty, $row:ty;)*) => {
        $(
            pub enum $stage {}

            impl Stage for $stage {
                const TABLE: &'static str = $table;
                const INDEX: &'static str = concat!($table, "_index");
                type Key = $key;
                type Row = $row;
            }
        )*
    };
}

stage_key!(TransferKey { model: Model, k: Wavenumber, z: Redshift });
stage_key!(GrowthKey { model: Model, params: GrowthParams, z: Redshift });
stage_key!(FilterPkKey { pk: LinearPk, params: FilterParams, k: Wavenumber });
stage_key!(LoopIntegralKey { model: Model, params: LoopParams, k: Wavenumber, pk: LinearPk, ir: IrCutoff, uv: UvCutoff });
stage_key!(MatsubaraXyKey { model: Model, params: MatsubaraXyParams, pk: LinearPk, ir_resum: IrResum });
stage_key!(OneLoopPkKey {
    model: Model, growth: GrowthParams, loop_params: LoopParams, k: Wavenumber,
    z: Redshift, pk: LinearPk, ir: IrCutoff, uv: UvCutoff,
});
stage_key!(ResumPkKey {
    model: Model, growth: GrowthParams, loop_params: LoopParams, xy: MatsubaraXyParams, k: Wavenumber,
    z: Redshift, pk: LinearPk, ir: IrCutoff, uv: UvCutoff, ir_resum: IrResum,
});

stages! {
    TransferStage     => "transfer",       TransferKey,     TransferRow;
    GrowthStage       => "growth_factors", GrowthKey,       GrowthRow;
    FilterPkStage     => "filtered_Pk",    FilterPkKey,     FilterPkRow;
    LoopIntegralStage => "loop_integral",  LoopIntegralKey, LoopIntegralRow;
    MatsubaraXyStage  => "Matsubara_XY",   MatsubaraXyKey,  MatsubaraXyRow;
    OneLoopPkStage    => "oneloop_Pk",     OneLoopPkKey,    OneLoopPkRow;
    ResumPkStage      => "resum_Pk",       ResumPkKey,      ResumPkRow;
    MultipolePkStage  => "multipole_Pk",   ResumPkKey,      MultipolePkRow;
}

/// Cost of producing a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub evaluations: u64,
    pub time_ns: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRow {
    pub delta_m: f64,
    pub theta_m: f64,
    pub provenance: Provenance,
}

/// Linear growth `g`, its rate `f`, and the second order factors with their rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthRow {
    pub g: f64,
    pub f: f64,
    pub a: f64,
    pub b: f64,
    pub f_a: f64,
    pub f_b: f64,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPkRow {
    pub raw: f64,
    pub nowiggle: f64,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopKernels {
    pub aa: Estimate,
    pub ab: Estimate,
    pub bb: Estimate,
    pub d: Estimate,
    pub e: Estimate,
    pub f: Estimate,
    pub g: Estimate,
    pub j1: Estimate,
    pub j2: Estimate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopIntegralRow {
    pub raw: LoopKernels,
    pub nowiggle: LoopKernels,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatsubaraXyRow {
    pub x: f64,
    pub y: f64,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PkParts {
    pub tree: f64,
    pub p13: Estimate,
    pub p22: Estimate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneLoopPkRow {
    pub raw: PkParts,
    pub nowiggle: PkParts,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumPkRow {
    pub tree: f64,
    pub resummed: Estimate,
    pub provenance: Provenance,
}

/// One Legendre moment of the redshift space power spectrum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Multipole {
    pub tree: f64,
    pub p13: Estimate,
    pub p22: Estimate,
    pub resummed: Estimate,
}

/// Moments `ell = 0, 2, 4`, keyed like the resummed spectrum they are projected from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipolePkRow {
    pub ell0: Multipole,
    pub ell2: Multipole,
    pub ell4: Multipole,
    pub provenance: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::*;

    fn loop_key(k: u32, ir: u32, uv: u32) -> LoopIntegralKey {
        LoopIntegralKey {
            model: ModelToken::new(0),
            params: LoopParamsToken::new(1),
            k: WavenumberToken::new(k),
            pk: LinearPkToken::new(2),
            ir: IrCutoffToken::new(ir),
            uv: UvCutoffToken::new(uv),
        }
    }

    #[test]
    fn encoded_keys_sort_like_tuples() {
        let a = loop_key(1, 0, 300);
        let b = loop_key(1, 1, 0);
        let c = loop_key(256, 0, 0);
        assert!(a < b && b < c);
        assert!(a.encode() < b.encode() && b.encode() < c.encode());
        assert_eq!(a.encode().len(), LoopIntegralKey::WIDTH);
        assert_eq!(LoopIntegralKey::WIDTH, 24);
    }

    #[test]
    fn key_decodes_back_and_rejects_bad_width() {
        let key = loop_key(7, 3, 9);
        assert_eq!(LoopIntegralKey::decode(&key.encode()).expect("decode"), key);
        assert!(LoopIntegralKey::decode(&key.encode()[..20]).is_err());
    }

    #[test]
    fn references_name_kind_tables() {
        let refs = loop_key(7, 3, 9).references();
        assert_eq!(refs[0], ("models", 0));
        assert_eq!(refs[2], ("k_config", 7));
        assert_eq!(refs[5], ("UV_cutoff_config", 9));
        assert_eq!(LoopIntegralStage::INDEX, "loop_integral_index");
    }

    #[test]
    fn multipoles_share_the_resummed_key_but_not_the_table() {
        assert_ne!(MultipolePkStage::TABLE, ResumPkStage::TABLE);
        assert_eq!(MultipolePkStage::INDEX, "multipole_Pk_index");
        assert_eq!(<MultipolePkStage as Stage>::Key::WIDTH, <ResumPkStage as Stage>::Key::WIDTH);
    }
}
