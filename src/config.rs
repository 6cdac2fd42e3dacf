//! Configuration: feature toggles and the tile parameter table.

use crate::ir::TileOverrides;

/// The six tile parameters of the blocked matmul schedule.
///
/// `m_c`/`n_c`/`k_c` are cache-level block sizes, `m_r`/`n_r` the register
/// tile, `k_u` the reduction unroll factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileParams {
    pub m_c: i64,
    pub n_c: i64,
    pub k_c: i64,
    pub m_r: i64,
    pub n_r: i64,
    pub k_u: i64,
}

impl Default for TileParams {
    fn default() -> Self {
        TileParams { m_c: 64, n_c: 128, k_c: 512, m_r: 4, n_r: 4, k_u: 4 }
    }
}

impl TileParams {
    /// Resolve per-nest annotations against the default table: any parameter
    /// the nest does not annotate uses its default value.
    pub fn resolve(overrides: &TileOverrides) -> TileParams {
        let d = TileParams::default();
        TileParams {
            m_c: overrides.m_c.unwrap_or(d.m_c),
            n_c: overrides.n_c.unwrap_or(d.n_c),
            k_c: overrides.k_c.unwrap_or(d.k_c),
            m_r: overrides.m_r.unwrap_or(d.m_r),
            n_r: overrides.n_r.unwrap_or(d.n_r),
            k_u: overrides.k_u.unwrap_or(d.k_u),
        }
    }
}

/// Feature toggles for one transformation run.
///
/// `scalar_replace` is carried for the configuration boundary only: it is
/// consumed by the cleanup pipeline that runs after this pass, never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptConfig {
    pub pack: bool,
    pub unroll: bool,
    pub vectorize: bool,
    pub scalar_replace: bool,
    /// Scalars per vector access when vectorizing the `jjR` loop.
    pub vector_width: i64,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig {
            pack: false,
            unroll: false,
            vectorize: false,
            scalar_replace: false,
            vector_width: 4,
        }
    }
}

impl OptConfig {
    /// All four feature toggles on.
    pub fn all_enabled() -> Self {
        OptConfig {
            pack: true,
            unroll: true,
            vectorize: true,
            scalar_replace: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_table() {
        let d = TileParams::default();
        assert_eq!((d.m_c, d.n_c, d.k_c), (64, 128, 512));
        assert_eq!((d.m_r, d.n_r, d.k_u), (4, 4, 4));
    }

    #[test]
    fn test_resolve_partial_override() {
        let o = TileOverrides { m_c: Some(32), k_u: Some(8), ..Default::default() };
        let p = TileParams::resolve(&o);
        assert_eq!(p.m_c, 32);
        assert_eq!(p.k_u, 8);
        assert_eq!(p.n_c, 128);
        assert_eq!(p.m_r, 4);
    }
}
