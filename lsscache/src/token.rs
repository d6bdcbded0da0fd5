//! Tokens are the stable integer ids standing in for tokenized configuration values.
//!
//! A token is namespaced by a zero-sized kind marker, so a redshift token can never be
//! passed where a wavenumber token is expected even though both wrap a `u32`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

pub trait TokenKind: Send + Sync + 'static {
    /// Name of the persistent table holding values of this kind.
    const TABLE: &'static str;
    /// Short label used in log lines and error messages.
    const LABEL: &'static str;
}

macro_rules! token_kinds {
    ($($kind:ident => $table:literal, $label:literal, $alias:ident;)*) => {
        /// Zero-sized kind markers.
        pub mod kind {
            use super::TokenKind;
            $(
                #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
                pub enum $kind {}

                impl TokenKind for $kind {
                    const TABLE: &'static str = $table;
                    const LABEL: &'static str = $label;
                }
            )*
        }

        $(
            pub type $alias = Token<kind::$kind>;
        )*
    };
}

token_kinds! {
    Model          => "models",              "model",          ModelToken;
    Redshift       => "z_config",            "z",              RedshiftToken;
    Wavenumber     => "k_config",            "k",              WavenumberToken;
    UvCutoff       => "UV_cutoff_config",    "UV cutoff",      UvCutoffToken;
    IrCutoff       => "IR_cutoff_config",    "IR cutoff",      IrCutoffToken;
    IrResum        => "IR_resum_config",     "IR resummation", IrResumToken;
    LinearPk       => "Pk_linear_config",    "linear Pk",      LinearPkToken;
    GrowthParams   => "growth_config",       "growth params",  GrowthParamsToken;
    LoopParams     => "loop_config",         "loop params",    LoopParamsToken;
    FilterParams   => "filter_config",       "filter params",  FilterParamsToken;
    MatsubaraXyParams => "Matsubara_XY_config", "Matsubara XY params", MatsubaraXyParamsToken;
}

pub struct Token<K: TokenKind> {
    id: u32,
    kind: PhantomData<fn() -> K>,
}

impl<K: TokenKind> Token<K> {
    pub const fn new(id: u32) -> Self {
        Token { id, kind: PhantomData }
    }

    pub const fn id(&self) -> u32 {
        self.id
    }
}

impl<K: TokenKind> Clone for Token<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: TokenKind> Copy for Token<K> {}

impl<K: TokenKind> PartialEq for Token<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K: TokenKind> Eq for Token<K> {}

impl<K: TokenKind> PartialOrd for Token<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: TokenKind> Ord for Token<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl<K: TokenKind> Hash for Token<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<K: TokenKind> fmt::Debug for Token<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", K::LABEL, self.id)
    }
}

impl<K: TokenKind> fmt::Display for Token<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<K: TokenKind> Serialize for Token<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.id)
    }
}

impl<'de, K: TokenKind> Deserialize<'de> for Token<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Token::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_compare_by_id_within_a_kind() {
        let a = RedshiftToken::new(3);
        let b = RedshiftToken::new(3);
        let c = RedshiftToken::new(4);
        assert_eq!(a, b);
        assert!(a < c);
        let set: HashSet<RedshiftToken> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn token_survives_codec_as_plain_id() {
        let token = UvCutoffToken::new(42);
        let bytes = bincode::serialize(&token).expect("encode");
        assert_eq!(bytes, 42u32.to_le_bytes().to_vec());
        let back: UvCutoffToken = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(back, token);
        assert_eq!(format!("{:?}", back), "UV cutoff#42");
    }
}
