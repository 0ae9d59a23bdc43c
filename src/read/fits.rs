//! Helper functions for reading FITS files.

use std::fmt::Display;
use std::path::Path;

use fitsio::{hdu::*, FitsFile};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitsError {
    #[error("Couldn't open {fits_filename}: {fits_error}")]
    Open {
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: Box<Path>,
    },

    #[error("{fits_filename} HDU {hdu_description}: {fits_error}")]
    Fitsio {
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: Box<Path>,
        hdu_description: Box<str>,
    },

    #[error("{fits_filename} HDU {hdu_num}: couldn't parse key {key}'s value '{value}'")]
    Parse {
        key: Box<str>,
        value: String,
        fits_filename: Box<Path>,
        hdu_num: usize,
    },

    #[error("{fits_filename} HDU {hdu_num}: expected key {key} to be present")]
    MissingKey {
        key: Box<str>,
        fits_filename: Box<Path>,
        hdu_num: usize,
    },
}

/// Open a fits file.
pub(crate) fn fits_open<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    FitsFile::open(file.as_ref()).map_err(|e| FitsError::Open {
        fits_error: Box::new(e),
        fits_filename: file.as_ref().to_path_buf().into_boxed_path(),
    })
}

/// Open a fits file's HDU.
pub(crate) fn fits_open_hdu<T: DescribesHdu + Display + Copy>(
    fits_fptr: &mut FitsFile,
    hdu_description: T,
) -> Result<FitsHdu, FitsError> {
    fits_fptr.hdu(hdu_description).map_err(|e| FitsError::Fitsio {
        fits_error: Box::new(e),
        fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
        hdu_description: format!("{hdu_description}").into_boxed_str(),
    })
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword that may
/// or may not exist, pull out the value of the keyword, parsing it into the
/// desired type.
pub(crate) fn fits_get_optional_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<Option<T>, FitsError> {
    let unparsed_value: String = match hdu.read_key(fits_fptr, keyword) {
        Ok(key_value) => key_value,
        Err(e) => match &e {
            // 202 and 204 mean the key isn't present.
            fitsio::errors::Error::Fits(fe) if fe.status == 202 || fe.status == 204 => {
                return Ok(None)
            }
            _ => {
                return Err(FitsError::Fitsio {
                    fits_error: Box::new(e),
                    fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
                    hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
                })
            }
        },
    };

    match unparsed_value.parse() {
        Ok(parsed_value) => Ok(Some(parsed_value)),
        Err(_) => Err(FitsError::Parse {
            key: keyword.to_string().into_boxed_str(),
            value: unparsed_value,
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_num: hdu.number + 1,
        }),
    }
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword, pull out
/// the value of the keyword, parsing it into the desired type.
pub(crate) fn fits_get_required_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<T, FitsError> {
    match fits_get_optional_key(fits_fptr, hdu, keyword)? {
        Some(value) => Ok(value),
        None => Err(FitsError::MissingKey {
            key: keyword.to_string().into_boxed_str(),
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_num: hdu.number + 1,
        }),
    }
}

/// Get a column from a fits file's HDU.
pub(crate) fn fits_get_col<T: fitsio::tables::ReadsCol>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<Vec<T>, FitsError> {
    hdu.read_col(fits_fptr, keyword).map_err(|e| FitsError::Fitsio {
        fits_error: Box::new(e),
        fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
        hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
    })
}
