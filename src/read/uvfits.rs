//! Reading from uvfits files.
//!
//! The uvfits random-group layout stores every polarisation of a
//! (time, baseline) row contiguously, so a single forward pass yields all
//! selected polarisations at once; there is never a reason to re-read the
//! file per polarisation.

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    ops::Range,
    path::{Path, PathBuf},
};

use fitsio::errors::check_status as fits_check_status;
use fitsio::{hdu::FitsHdu, FitsFile};
use hifitime::{Duration, Epoch, TimeUnits};
use log::{debug, trace};
use marlu::c32;
use ndarray::ArrayViewMut4;
use thiserror::Error;
use vec1::Vec1;

use super::{
    check_shapes,
    fits::{fits_get_col, fits_get_optional_key, fits_get_required_key, fits_open, fits_open_hdu,
           FitsError},
    VisRead, VisReadError,
};
use crate::{
    selection::{Pol, ResolvedSelection, SelectionError},
    ObsContext, VisInputType,
};

/// How many rows of group parameters to scan per cfitsio call. Bounds the
/// metadata scan's memory the same way chunking bounds the data read.
const GROUP_PARAM_BLOCK: usize = 8192;

pub struct UvfitsReader {
    /// Observation metadata.
    obs_context: ObsContext,

    /// The path to the uvfits on disk.
    uvfits: PathBuf,

    /// The uvfits-specific metadata, like which indices contain which
    /// parameters.
    metadata: UvfitsMetadata,

    /// The "stride" of the data, i.e. the number of rows (baselines) before
    /// the time index changes.
    step: usize,
}

impl UvfitsReader {
    /// Verify and populate metadata associated with this uvfits file.
    pub fn new<P: AsRef<Path>>(uvfits: P) -> Result<UvfitsReader, UvfitsReadError> {
        let uvfits = uvfits.as_ref();
        debug!("Using uvfits file: {}", uvfits.display());
        if !uvfits.exists() {
            return Err(UvfitsReadError::BadFile(uvfits.to_path_buf()));
        }

        let mut uvfits_fptr = fits_open(uvfits)?;
        let primary_hdu = fits_open_hdu(&mut uvfits_fptr, 0)?;
        let antenna_table_hdu = fits_open_hdu(&mut uvfits_fptr, "AIPS AN")?;

        let tile_names: Vec<String> =
            fits_get_col(&mut uvfits_fptr, &antenna_table_hdu, "ANNAME")?;
        let tile_names =
            Vec1::try_from_vec(tile_names).map_err(|_| UvfitsReadError::AnnameEmpty)?;
        let total_num_tiles = tile_names.len();

        // NOSTA contains the antenna numbers used by the BASELINE/ANTENNA
        // group parameters; they need not be 0- or 1-based.
        let tile_nums: Vec<u32> = fits_get_col(&mut uvfits_fptr, &antenna_table_hdu, "NOSTA")?;
        let tile_map: HashMap<usize, usize> = tile_nums
            .into_iter()
            .map(|n| n as usize)
            .zip(0..total_num_tiles)
            .collect();

        let metadata = UvfitsMetadata::new(&mut uvfits_fptr, &primary_hdu, &tile_map)?;
        if metadata.num_rows == 0 {
            return Err(UvfitsReadError::Empty(uvfits.to_path_buf()));
        }

        debug!("Number of rows in the uvfits:   {}", metadata.num_rows);
        debug!("PCOUNT:                         {}", metadata.pcount);
        debug!("Number of polarisations:        {}", metadata.pols.len());
        debug!("Floats per polarisation:        {}", metadata.floats_per_pol);
        debug!(
            "Number of fine frequency chans: {}",
            metadata.num_fine_freq_chans
        );

        let num_timestamps = metadata.jd_frac_timestamps.len();
        if num_timestamps == 0 {
            return Err(UvfitsReadError::NoTimesteps {
                file: uvfits.to_path_buf(),
            });
        }
        if metadata.num_rows % num_timestamps != 0 {
            return Err(UvfitsReadError::UnevenRows {
                num_rows: metadata.num_rows,
                num_timestamps,
            });
        }
        let step = metadata.num_rows / num_timestamps;
        if metadata.ant_pairs.len() != step {
            return Err(UvfitsReadError::UnevenRows {
                num_rows: metadata.num_rows,
                num_timestamps,
            });
        }

        // `jd_zero` comes from the PZERO of the DATE key(s); it's supposed to
        // "encode the Julian date at midnight of the first day of the
        // observation".
        let jd_zero = Epoch::from_jde_utc(metadata.jd_zero);
        let (all_timesteps, timestamps): (Vec<usize>, Vec<Epoch>) = metadata
            .jd_frac_timestamps
            .iter()
            .enumerate()
            .map(|(i, &jd_frac)| {
                // uvfits timestamps are in the middle of their respective
                // integration periods (centroids), so no adjustment for half
                // the integration time is needed here. Round to the nearest
                // 10 milliseconds to avoid float precision issues.
                (i, (jd_zero + jd_frac).round(10.milliseconds()))
            })
            .unzip();
        // uvfits carries no per-timestep flags; treat everything as available.
        let unflagged_timesteps = all_timesteps.clone();
        let all_timesteps =
            Vec1::try_from_vec(all_timesteps).expect("num_timestamps verified above");
        let timestamps = Vec1::try_from_vec(timestamps).expect("num_timestamps verified above");

        match timestamps.as_slice() {
            [t] => debug!("Only timestep (GPS): {:.2}", t.to_gpst_seconds()),
            [t0, .., tn] => {
                debug!("First timestep (GPS): {:.2}", t0.to_gpst_seconds());
                debug!("Last timestep  (GPS): {:.2}", tn.to_gpst_seconds());
            }
            [] => unreachable!("checked above"),
        }

        let time_res = if timestamps.len() < 2 {
            Duration::from_seconds(1.0)
        } else {
            timestamps
                .windows(2)
                .fold(Duration::from_seconds(f64::INFINITY), |a, t| {
                    a.min(t[1] - t[0])
                })
        };

        // Frequency axis from the FREQ CRVAL/CRPIX/CDELT.
        let freq_val_str = format!("CRVAL{}", metadata.indices.freq);
        let base_freq: f64 = parse_key(&mut uvfits_fptr, &primary_hdu, &freq_val_str)?;
        let freq_val_str = format!("CRPIX{}", metadata.indices.freq);
        // CRPIX might be a float. Parse it as one, then make it an int.
        let base_index: isize = {
            let f: f64 = parse_key(&mut uvfits_fptr, &primary_hdu, &freq_val_str)?;
            f.round() as _
        };
        let freq_val_str = format!("CDELT{}", metadata.indices.freq);
        let freq_res: f64 = parse_key(&mut uvfits_fptr, &primary_hdu, &freq_val_str)?;

        let mut fine_chan_freqs = Vec::with_capacity(metadata.num_fine_freq_chans);
        for i in 0..metadata.num_fine_freq_chans {
            let freq = (base_freq + (i as isize - base_index + 1) as f64 * freq_res).round();
            fine_chan_freqs.push(freq as u64);
        }
        let fine_chan_freqs =
            Vec1::try_from_vec(fine_chan_freqs).expect("NAXIS of FREQ is at least 1");

        let pols =
            Vec1::try_from_vec(metadata.pols.clone()).expect("NAXIS of STOKES is at least 1");
        let ant_pairs = Vec1::try_from_vec(metadata.ant_pairs.clone())
            .expect("step verified to be at least 1");

        let obs_context = ObsContext {
            timestamps,
            all_timesteps,
            unflagged_timesteps,
            tile_names,
            ant_pairs,
            pols,
            time_res,
            freq_res,
            fine_chan_freqs,
        };

        Ok(UvfitsReader {
            obs_context,
            uvfits: uvfits.to_path_buf(),
            metadata,
            step,
        })
    }

    fn read_range_inner(
        &self,
        mut vis_tbfp: ArrayViewMut4<c32>,
        mut flags_tbfp: ArrayViewMut4<bool>,
        timesteps: Range<usize>,
        selection: &ResolvedSelection,
    ) -> Result<(), VisReadError> {
        let num_timestamps = self.obs_context.timestamps.len();
        if timesteps.end > num_timestamps || timesteps.start > timesteps.end {
            return Err(VisReadError::BadTimestepRange {
                start: timesteps.start,
                end: timesteps.end,
                num_timesteps: num_timestamps,
            });
        }
        let num_freqs = self.metadata.num_fine_freq_chans;
        check_shapes("vis", vis_tbfp.dim(), timesteps.len(), selection, num_freqs)?;
        check_shapes(
            "flags",
            flags_tbfp.dim(),
            timesteps.len(),
            selection,
            num_freqs,
        )?;

        let num_file_pols = self.metadata.pols.len();
        let fpp = usize::from(self.metadata.floats_per_pol);
        let floats_per_row = num_freqs * num_file_pols * fpp;

        let mut uvfits = fits_open(&self.uvfits).map_err(UvfitsReadError::from)?;
        fits_open_hdu(&mut uvfits, 0).map_err(UvfitsReadError::from)?;
        // One row's worth of scratch, reused for every selected row.
        let mut row_floats = vec![0.0_f32; floats_per_row];

        for (i_t, timestep) in timesteps.enumerate() {
            trace!("Reading uvfits timestep {timestep}");
            for (i_bl, &row) in selection.baselines.iter().enumerate() {
                let row_num = timestep * self.step + row;
                let mut status = 0;
                unsafe {
                    // ffgpve = fits_read_img_flt
                    fitsio_sys::ffgpve(
                        uvfits.as_raw(), /* I - FITS file pointer                       */
                        (1 + row_num) as i64, /* I - group to read (1 = 1st group)      */
                        1,               /* I - first vector element to read (1 = 1st)  */
                        row_floats.len() as i64, /* I - number of values to read        */
                        0.0,             /* I - value for undefined pixels              */
                        row_floats.as_mut_ptr(), /* O - array of values that are returned */
                        &mut 0,          /* O - set to 1 if any values are null; else 0 */
                        &mut status,     /* IO - error status                           */
                    );
                }
                fits_check_status(status)
                    .map_err(|err| UvfitsReadError::ReadVis { row_num, err })?;

                for i_freq in 0..num_freqs {
                    for (i_pol, &pol_src) in selection.pol_indices.iter().enumerate() {
                        // COMPLEX is the fastest-moving axis, then STOKES,
                        // then FREQ.
                        let base = (i_freq * num_file_pols + pol_src) * fpp;
                        vis_tbfp[(i_t, i_bl, i_freq, i_pol)] =
                            c32::new(row_floats[base], row_floats[base + 1]);
                        flags_tbfp[(i_t, i_bl, i_freq, i_pol)] =
                            fpp == 3 && row_floats[base + 2] <= 0.0;
                    }
                }
            }
        }

        Ok(())
    }
}

impl VisRead for UvfitsReader {
    fn get_obs_context(&self) -> &ObsContext {
        &self.obs_context
    }

    fn get_input_data_type(&self) -> VisInputType {
        VisInputType::Uvfits
    }

    fn read_range(
        &self,
        vis_tbfp: ArrayViewMut4<c32>,
        flags_tbfp: ArrayViewMut4<bool>,
        timesteps: Range<usize>,
        selection: &ResolvedSelection,
    ) -> Result<(), VisReadError> {
        self.read_range_inner(vis_tbfp, flags_tbfp, timesteps, selection)
    }
}

fn parse_key<T: std::str::FromStr>(
    uvfits: &mut FitsFile,
    hdu: &FitsHdu,
    key: &str,
) -> Result<T, UvfitsReadError> {
    let s: String = fits_get_required_key(uvfits, hdu, key)?;
    s.parse().map_err(|_| UvfitsReadError::Parse {
        key: Cow::from(key.to_string()),
        value: s,
    })
}

struct UvfitsMetadata {
    /// The number of rows in the uvfits file (equal to the number of
    /// timesteps * the number of baselines).
    num_rows: usize,

    /// The number of parameters in each uvfits group (PCOUNT).
    pcount: usize,

    /// The number of fine channel frequencies.
    num_fine_freq_chans: usize,

    /// The polarisations present, in storage order.
    pols: Vec<Pol>,

    /// Floats per polarisation (2 = re/im, 3 = re/im/weight).
    floats_per_pol: u8,

    /// The indices of various parameters (e.g. BASELINE is PTYPE4, DATE is
    /// PTYPE5, etc.)
    indices: Indices,

    /// The summed PZERO of the DATE key(s).
    jd_zero: f64,

    /// Unique collection of JD fractions for timestamps.
    jd_frac_timestamps: Vec<Duration>,

    /// The 0-based tile-index pairs of the rows comprising the first
    /// timestep; every other timestep is assumed to repeat this layout.
    ant_pairs: Vec<(usize, usize)>,
}

impl UvfitsMetadata {
    /// Get metadata on the supplied uvfits file.
    ///
    /// This function assumes the correct HDU has already been opened (should
    /// be HDU 1, index 0).
    fn new(
        uvfits: &mut FitsFile,
        hdu: &FitsHdu,
        tile_map: &HashMap<usize, usize>,
    ) -> Result<UvfitsMetadata, UvfitsReadError> {
        let indices = Indices::new(uvfits, hdu)?;

        // GCOUNT tells us how many rows are in the file, PCOUNT how many
        // parameters each group carries.
        let num_rows: usize = parse_key(uvfits, hdu, "GCOUNT")?;
        let pcount: usize = parse_key(uvfits, hdu, "PCOUNT")?;
        if pcount == 0 {
            return Err(UvfitsReadError::Parse {
                key: Cow::from("PCOUNT"),
                value: "0".to_string(),
            });
        }

        // We expect the COMPLEX index to be 2 (mandated by the standard), the
        // STOKES index to be 3, and the FREQ index to be 4. The order of these
        // indices determines the shape of the array of visibilities, and we
        // currently only support this one particular order.
        if indices.complex != 2 || indices.stokes != 3 || indices.freq != 4 {
            return Err(UvfitsReadError::WrongDataOrder {
                complex: indices.complex,
                stokes: indices.stokes,
                freq: indices.freq,
            });
        }

        // NAXIS2 (COMPLEX) is how many floats are associated with a
        // polarisation. It must be either 2 or 3, as per the standard. The
        // first two floats represent the real and imag part of a complex
        // number, respectively, and the optional third is the weight; a
        // non-positive weight flags the sample.
        let floats_per_pol: u8 = parse_key(uvfits, hdu, "NAXIS2")?;
        match floats_per_pol {
            2 | 3 => (),
            _ => return Err(UvfitsReadError::WrongFloatsPerPolCount(floats_per_pol)),
        }

        // The polarisations are described by the NAXIS/CRVAL/CDELT keys
        // associated with STOKES.
        let stokes_naxis_str = format!("NAXIS{}", indices.stokes);
        let num_pols: usize = parse_key(uvfits, hdu, &stokes_naxis_str)?;
        let stokes_crval_str = format!("CRVAL{}", indices.stokes);
        let first_pol_code: f32 = parse_key(uvfits, hdu, &stokes_crval_str)?;
        let stokes_cdelt_str = format!("CDELT{}", indices.stokes);
        let pol_code_step: f32 = parse_key::<f32>(uvfits, hdu, &stokes_cdelt_str)
            .unwrap_or(if first_pol_code < 0.0 { -1.0 } else { 1.0 });
        let mut pols = Vec::with_capacity(num_pols);
        for i in 0..num_pols {
            let code = first_pol_code + i as f32 * pol_code_step;
            if code.abs() > 127.0 {
                return Err(UvfitsReadError::UnsupportedPolType {
                    key: Cow::from(stokes_crval_str),
                    value: code as i64,
                });
            }
            pols.push(Pol::from_uvfits_code(code.round() as i8)?);
        }

        // The number of fine-frequency channels is the NAXIS associated with
        // FREQ.
        let freq_naxis_str = format!("NAXIS{}", indices.freq);
        let num_fine_freq_chans: usize = parse_key(uvfits, hdu, &freq_naxis_str)?;

        // The PZERO(s) of the DATE key(s) offset every row's JD fraction.
        let mut jd_zero: f64 = fits_get_optional_key::<f64>(
            uvfits,
            hdu,
            &format!("PZERO{}", indices.date1),
        )?
        .unwrap_or_default();
        if let Some(d2) = indices.date2 {
            jd_zero += fits_get_optional_key::<f64>(uvfits, hdu, &format!("PZERO{d2}"))?
                .unwrap_or_default();
        }

        // Scan the group parameters for unique timestamps and the first
        // timestep's baseline layout. Done in bounded blocks so the scan's
        // memory doesn't scale with the file.
        let mut jd_frac_timestamp_set = HashSet::new();
        let mut jd_frac_timestamps: Vec<Duration> = vec![];
        let mut ant_pairs: Vec<(usize, usize)> = vec![];
        let mut group_params = vec![0.0_f32; pcount * GROUP_PARAM_BLOCK.min(num_rows.max(1))];
        let mut row = 0;
        while row < num_rows {
            let block_len = GROUP_PARAM_BLOCK.min(num_rows - row);
            let num_floats = pcount * block_len;
            let mut status = 0;
            unsafe {
                // ffggpe = fits_read_grppar_flt
                fitsio_sys::ffggpe(
                    uvfits.as_raw(), /* I - FITS file pointer                       */
                    (1 + row) as i64, /* I - group to read (1 = 1st group)          */
                    1,               /* I - first vector element to read (1 = 1st)  */
                    num_floats as i64, /* I - number of values to read              */
                    group_params.as_mut_ptr(), /* O - array of values that are returned */
                    &mut status,     /* IO - error status                           */
                );
            }
            fits_check_status(status).map_err(UvfitsReadError::Metadata)?;

            for (i, params) in group_params[..num_floats].chunks_exact(pcount).enumerate() {
                let jd_frac = {
                    let mut t =
                        Duration::from_days(f64::from(params[usize::from(indices.date1) - 1]));
                    // Use the second date, if it's there.
                    if let Some(d2) = indices.date2 {
                        t += Duration::from_days(f64::from(params[usize::from(d2) - 1]));
                    }
                    t
                };
                if jd_frac_timestamp_set.insert(jd_frac.total_nanoseconds()) {
                    jd_frac_timestamps.push(jd_frac);
                }

                // The first timestep defines the baseline layout.
                if jd_frac_timestamps.len() == 1 {
                    let row_num = row + i;
                    let (ant1, ant2) = match indices.baseline_info {
                        BaselineInfo::Baseline(i_bl) => {
                            decode_baseline(f64::from(params[usize::from(i_bl) - 1]))
                        }
                        BaselineInfo::Antennas(i_a1, i_a2) => (
                            params[usize::from(i_a1) - 1].round() as usize,
                            params[usize::from(i_a2) - 1].round() as usize,
                        ),
                    };
                    let pair = match (tile_map.get(&ant1), tile_map.get(&ant2)) {
                        (Some(&t1), Some(&t2)) => (t1, t2),
                        _ => {
                            return Err(UvfitsReadError::BadBaseline {
                                ant1,
                                ant2,
                                row_num,
                            })
                        }
                    };
                    ant_pairs.push(pair);
                }
            }
            row += block_len;
        }

        Ok(UvfitsMetadata {
            num_rows,
            pcount,
            num_fine_freq_chans,
            pols,
            floats_per_pol,
            indices,
            jd_zero,
            jd_frac_timestamps,
            ant_pairs,
        })
    }
}

/// Decode a uvfits BASELINE parameter into a pair of (1-based) antenna
/// numbers. Values above 65535 use the extended 2048-antenna convention.
fn decode_baseline(bl: f64) -> (usize, usize) {
    let bl = bl.round() as usize;
    if bl > 65535 {
        ((bl - 65536) / 2048, (bl - 65536) % 2048)
    } else {
        (bl / 256, bl % 256)
    }
}

/// How the antenna pair of each row is encoded.
#[derive(Debug, Clone, Copy)]
enum BaselineInfo {
    /// A single BASELINE group parameter (PTYPE index).
    Baseline(u8),
    /// ANTENNA1 and ANTENNA2 group parameters (PTYPE indices).
    Antennas(u8, u8),
}

#[derive(Debug)]
struct Indices {
    /// PTYPE of the first DATE key.
    date1: u8,
    /// PTYPE of the optional second DATE key.
    date2: Option<u8>,
    /// How baselines are encoded.
    baseline_info: BaselineInfo,
    /// CTYPE
    complex: u8,
    /// CTYPE
    stokes: u8,
    /// CTYPE
    freq: u8,
}

impl Indices {
    /// Find the 1-indexed indices of the "PTYPE" and "CTYPE" keys we require.
    /// "BASELINE" will be in most uvfits files, but "ANTENNA1" and "ANTENNA2"
    /// may be used instead; exactly one of the two must be present. A second
    /// "DATE"/"_DATE" key may also be present but does not have to be.
    fn new(uvfits: &mut FitsFile, hdu: &FitsHdu) -> Result<Indices, UvfitsReadError> {
        // Accumulate the "PTYPE" keys.
        let mut ptypes = Vec::with_capacity(12);
        for i in 1.. {
            let ptype: Option<String> =
                fits_get_optional_key(uvfits, hdu, &format!("PTYPE{i}"))?;
            match ptype {
                Some(ptype) => ptypes.push(ptype),

                // We've found the last PTYPE.
                None => break,
            }
        }

        let mut baseline_index = None;
        let mut antenna1_index = None;
        let mut antenna2_index = None;
        let mut date1_index = None;
        let mut date2_index = None;

        for (i, key) in ptypes.into_iter().enumerate() {
            let ii = (i + 1) as u8;
            match key.as_str() {
                "BASELINE" => baseline_index.get_or_insert(ii),
                "ANTENNA1" => antenna1_index.get_or_insert(ii),
                "ANTENNA2" => antenna2_index.get_or_insert(ii),
                "DATE" | "_DATE" => match (date1_index, date2_index) {
                    (None, None) => date1_index.get_or_insert(ii),
                    (Some(_), None) => date2_index.get_or_insert(ii),
                    _ => continue,
                },
                _ => continue,
            };
        }

        let date1 = date1_index.ok_or(UvfitsReadError::MissingDate)?;

        let baseline_info = match (baseline_index, antenna1_index, antenna2_index) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(UvfitsReadError::BaselineAndAntennas)
            }
            (Some(bl), None, None) => BaselineInfo::Baseline(bl),
            (None, Some(a1), Some(a2)) => BaselineInfo::Antennas(a1, a2),
            (None, Some(_), None) => return Err(UvfitsReadError::Antenna1ButNotAntenna2),
            (None, None, Some(_)) => return Err(UvfitsReadError::Antenna2ButNotAntenna1),
            (None, None, None) => return Err(UvfitsReadError::NoBaselineInfo),
        };

        // Now find CTYPEs.
        let mut ctypes = Vec::with_capacity(12);
        for i in 2.. {
            let ctype: Option<String> =
                fits_get_optional_key(uvfits, hdu, &format!("CTYPE{i}"))?;
            match ctype {
                Some(ctype) => ctypes.push(ctype),

                // We've found the last CTYPE.
                None => break,
            }
        }

        let mut complex_index = None;
        let mut stokes_index = None;
        let mut freq_index = None;

        for (i, key) in ctypes.into_iter().enumerate() {
            let ii = (i + 2) as u8;
            match key.as_str() {
                "COMPLEX" => complex_index = Some(ii),
                "STOKES" => stokes_index = Some(ii),
                "FREQ" => freq_index = Some(ii),
                _ => (),
            }
        }

        match (complex_index, stokes_index, freq_index) {
            (Some(complex), Some(stokes), Some(freq)) => Ok(Indices {
                date1,
                date2: date2_index,
                baseline_info,
                complex,
                stokes,
                freq,
            }),
            _ => Err(UvfitsReadError::MissingDataAxes),
        }
    }
}

#[derive(Error, Debug)]
pub enum UvfitsReadError {
    #[error("Supplied file path {0} does not exist or is not readable!")]
    BadFile(PathBuf),

    #[error("Supplied file path {0} does not contain any data")]
    Empty(PathBuf),

    #[error("No timesteps were in file {file}")]
    NoTimesteps { file: PathBuf },

    #[error("No antenna names were in the ANNAME column")]
    AnnameEmpty,

    #[error("No DATE group parameter was present")]
    MissingDate,

    #[error("The COMPLEX, STOKES and FREQ data axes were not all present")]
    MissingDataAxes,

    #[error("BASELINE is specified as well as ANTENNA1/ANTENNA2; this is unsupported")]
    BaselineAndAntennas,

    #[error("Found an index for ANTENNA1, but not ANTENNA2; cannot continue")]
    Antenna1ButNotAntenna2,

    #[error("Found an index for ANTENNA2, but not ANTENNA1; cannot continue")]
    Antenna2ButNotAntenna1,

    #[error("None of BASELINE, ANTENNA1 or ANTENNA2 were specified; cannot continue")]
    NoBaselineInfo,

    #[error("There are {0} floats per polarisation; this is unsupported. The uvfits standard enforces only 2 or 3 floats per polarisation")]
    WrongFloatsPerPolCount(u8),

    #[error("The shape of the visibility data is unsupported; we expect COMPLEX to be NAXIS2 (got {complex}), STOKES to be NAXIS3 (got {stokes}), and FREQ to be NAXIS4 (got {freq})")]
    WrongDataOrder { complex: u8, stokes: u8, freq: u8 },

    #[error("STOKES {key} indicates a polarisation type '{value}', which is currently unsupported")]
    UnsupportedPolType { key: Cow<'static, str>, value: i64 },

    #[error("Could not parse key {key}'s value {value} into a number")]
    Parse { key: Cow<'static, str>, value: String },

    #[error("Row {row_num} refers to antennas ({ant1}, {ant2}), which aren't in the antenna table")]
    BadBaseline {
        ant1: usize,
        ant2: usize,
        row_num: usize,
    },

    #[error("The number of rows ({num_rows}) isn't an integer multiple of the number of timestamps ({num_timestamps})")]
    UnevenRows {
        num_rows: usize,
        num_timestamps: usize,
    },

    #[error("When attempting to read uvfits baseline metadata, cfitsio gave an error: {0}")]
    Metadata(fitsio::errors::Error),

    #[error("When attempting to read uvfits row {row_num}, cfitsio gave an error: {err}")]
    ReadVis {
        row_num: usize,
        err: fitsio::errors::Error,
    },

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Fits(#[from] FitsError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_baseline_conventions() {
        assert_eq!(decode_baseline(258.0), (1, 2));
        assert_eq!(decode_baseline(256.0 * 128.0 + 128.0), (128, 128));
        // Extended convention for arrays larger than 255 antennas.
        assert_eq!(decode_baseline(65536.0 + 2048.0 * 3.0 + 7.0), (3, 7));
    }
}
