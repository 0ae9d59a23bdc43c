//! Read-time selection of baselines and polarisations.
//!
//! Selections are validated and resolved against an [`ObsContext`] exactly
//! once, before any data is read; the resolved index lists bound the memory
//! of every chunk that follows. Nothing is re-interpreted per chunk.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::ObsContext;

/// A visibility polarisation, named by the uvfits/AIPS Stokes convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pol {
    XX,
    YY,
    XY,
    YX,
    RR,
    LL,
    RL,
    LR,
    I,
    Q,
    U,
    V,
}

impl Pol {
    /// Decode a uvfits STOKES axis value (CRVAL + i * CDELT).
    pub fn from_uvfits_code(code: i8) -> Result<Pol, SelectionError> {
        match code {
            1 => Ok(Pol::I),
            2 => Ok(Pol::Q),
            3 => Ok(Pol::U),
            4 => Ok(Pol::V),
            -1 => Ok(Pol::RR),
            -2 => Ok(Pol::LL),
            -3 => Ok(Pol::RL),
            -4 => Ok(Pol::LR),
            -5 => Ok(Pol::XX),
            -6 => Ok(Pol::YY),
            -7 => Ok(Pol::XY),
            -8 => Ok(Pol::YX),
            _ => Err(SelectionError::UnknownPolCode(code)),
        }
    }
}

impl fmt::Display for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Pol::XX => "XX",
            Pol::YY => "YY",
            Pol::XY => "XY",
            Pol::YX => "YX",
            Pol::RR => "RR",
            Pol::LL => "LL",
            Pol::RL => "RL",
            Pol::LR => "LR",
            Pol::I => "I",
            Pol::Q => "Q",
            Pol::U => "U",
            Pol::V => "V",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Pol {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Pol, SelectionError> {
        match s.trim().to_uppercase().as_str() {
            "XX" => Ok(Pol::XX),
            "YY" => Ok(Pol::YY),
            "XY" => Ok(Pol::XY),
            "YX" => Ok(Pol::YX),
            "RR" => Ok(Pol::RR),
            "LL" => Ok(Pol::LL),
            "RL" => Ok(Pol::RL),
            "LR" => Ok(Pol::LR),
            "I" => Ok(Pol::I),
            "Q" => Ok(Pol::Q),
            "U" => Ok(Pol::U),
            "V" => Ok(Pol::V),
            _ => Err(SelectionError::UnknownPolName(s.to_string())),
        }
    }
}

/// Which baseline class contributes to the spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumType {
    /// Cross-correlations only.
    Cross,
    /// Auto-correlations only.
    Auto,
    /// Everything.
    All,
}

impl FromStr for SpectrumType {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<SpectrumType, SelectionError> {
        match s.trim().to_lowercase().as_str() {
            "cross" => Ok(SpectrumType::Cross),
            "auto" => Ok(SpectrumType::Auto),
            "all" => Ok(SpectrumType::All),
            _ => Err(SelectionError::UnknownSpectrumType(s.to_string())),
        }
    }
}

/// User-facing selection, as it comes off the command line.
#[derive(Debug, Clone)]
pub struct VisSelection {
    /// Polarisations to keep. Empty means all.
    pub pols: Vec<Pol>,

    /// Antenna names to keep. Empty means all. Mutually exclusive with
    /// `skip_ants`.
    pub sel_ants: Vec<String>,

    /// Antenna names to drop.
    pub skip_ants: Vec<String>,

    pub spectrum_type: SpectrumType,
}

impl Default for VisSelection {
    fn default() -> VisSelection {
        VisSelection {
            pols: vec![],
            sel_ants: vec![],
            skip_ants: vec![],
            spectrum_type: SpectrumType::Cross,
        }
    }
}

/// A selection resolved against one observation: plain index lists into the
/// source's baseline-row and polarisation axes.
#[derive(Debug, Clone)]
pub struct ResolvedSelection {
    /// Indices of the kept baseline rows within one timestep.
    pub baselines: Vec<usize>,

    /// The tile-index pairs of the kept rows, in the same order.
    pub ant_pairs: Vec<(usize, usize)>,

    /// Indices of the kept polarisations in the source's storage order.
    pub pol_indices: Vec<usize>,

    /// The kept polarisations, in the same order.
    pub pols: Vec<Pol>,
}

impl ResolvedSelection {
    pub fn num_baselines(&self) -> usize {
        self.baselines.len()
    }

    pub fn num_pols(&self) -> usize {
        self.pol_indices.len()
    }
}

fn sanitize(name: &str) -> String {
    name.trim().to_uppercase()
}

impl VisSelection {
    /// Resolve this selection against an observation. Called once, before any
    /// chunk is read.
    pub fn resolve(&self, obs_context: &ObsContext) -> Result<ResolvedSelection, SelectionError> {
        if !self.sel_ants.is_empty() && !self.skip_ants.is_empty() {
            return Err(SelectionError::SelAndSkipAnts);
        }

        let tile_names: Vec<String> = obs_context
            .tile_names
            .iter()
            .map(|n| sanitize(n))
            .collect();
        let find_tile = |name: &String| -> Result<usize, SelectionError> {
            let name = sanitize(name);
            tile_names
                .iter()
                .position(|t| *t == name)
                .ok_or(SelectionError::UnknownAntenna(name))
        };

        // Convert the name-based antenna selection into a per-tile keep mask.
        let mut keep_tile = vec![true; tile_names.len()];
        if !self.sel_ants.is_empty() {
            keep_tile.iter_mut().for_each(|k| *k = false);
            for name in &self.sel_ants {
                keep_tile[find_tile(name)?] = true;
            }
        }
        for name in &self.skip_ants {
            keep_tile[find_tile(name)?] = false;
        }

        let mut baselines = vec![];
        let mut ant_pairs = vec![];
        for (i_bl, &(ant1, ant2)) in obs_context.ant_pairs.iter().enumerate() {
            let class_ok = match self.spectrum_type {
                SpectrumType::Cross => ant1 != ant2,
                SpectrumType::Auto => ant1 == ant2,
                SpectrumType::All => true,
            };
            if class_ok && keep_tile[ant1] && keep_tile[ant2] {
                baselines.push(i_bl);
                ant_pairs.push((ant1, ant2));
            }
        }
        if baselines.is_empty() {
            return Err(SelectionError::NoBaselines);
        }

        let (pol_indices, pols) = if self.pols.is_empty() {
            (
                (0..obs_context.pols.len()).collect(),
                obs_context.pols.to_vec(),
            )
        } else {
            let mut pol_indices = vec![];
            let mut pols = vec![];
            for &pol in &self.pols {
                let i_pol = obs_context
                    .pols
                    .iter()
                    .position(|&p| p == pol)
                    .ok_or(SelectionError::PolNotInData(pol))?;
                if !pol_indices.contains(&i_pol) {
                    pol_indices.push(i_pol);
                    pols.push(pol);
                }
            }
            (pol_indices, pols)
        };

        Ok(ResolvedSelection {
            baselines,
            ant_pairs,
            pol_indices,
            pols,
        })
    }
}

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("uvfits STOKES code {0} does not name a known polarisation")]
    UnknownPolCode(i8),

    #[error("'{0}' does not name a known polarisation")]
    UnknownPolName(String),

    #[error("'{0}' is not one of 'auto', 'cross' or 'all'")]
    UnknownSpectrumType(String),

    #[error("Both antennas to select and antennas to skip were specified; use one or the other")]
    SelAndSkipAnts,

    #[error("Antenna '{0}' is not present in the input data")]
    UnknownAntenna(String),

    #[error("Polarisation {0} is not present in the input data")]
    PolNotInData(Pol),

    #[error("The selection leaves no baselines to read")]
    NoBaselines,
}
