//! Trust Anchor Locators.
//!
//! A TAL identifies one root CA by an ordered list of URIs to try the
//! certificate at and the certificate's expected public key. It is parsed
//! once from a file and never mutated afterwards -- all the runtime state
//! for a trust anchor lives in [`TrustAnchor`][crate::trust_anchor::TrustAnchor]
//! instead.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use bytes::Bytes;
use log::{debug, error, warn};
use rpki::uri;


//------------ Tal -------------------------------------------------------------

/// An immutable trust anchor locator.
#[derive(Clone, Debug)]
pub struct Tal {
    /// A human-readable name for the CA, derived from the TAL's file name.
    name: String,

    /// The certificate locations, tried in order on fetch failure.
    ///
    /// RFC 8630 requires at least one; [`Tal::read`] enforces this.
    certificate_locations: Vec<uri::Rsync>,

    /// Hint URIs for bulk warm-up. May be empty.
    prefetch_uris: Vec<uri::Rsync>,

    /// The base64-decoded SubjectPublicKeyInfo of the anchor certificate.
    key_info: Bytes,
}

impl Tal {
    /// Reads a single TAL from `reader`, naming it `name`.
    pub fn read_named(
        name: String, reader: &mut impl Read
    ) -> Result<Self, ReadError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let mut data = data.as_slice();

        let mut certificate_locations = Vec::new();
        while let Some(line) = take_line(&mut data)? {
            if line.is_empty() {
                break
            }
            certificate_locations.push(parse_uri(line)?);
        }
        if certificate_locations.is_empty() {
            return Err(ReadError::NoCertificateLocation)
        }

        let key_info = base64::decode(
            data.iter().copied()
                .filter(|&b| !b.is_ascii_whitespace())
                .collect::<Vec<u8>>()
        )?;

        Ok(Tal {
            name,
            certificate_locations,
            prefetch_uris: Vec::new(),
            key_info: key_info.into(),
        })
    }

    /// Attaches hint URIs for bulk warm-up.
    ///
    /// These are not part of the RFC 8630 file format; operators that want
    /// them configure them out of band and wire them in here.
    pub fn with_prefetch_uris(mut self, uris: Vec<uri::Rsync>) -> Self {
        self.prefetch_uris = uris;
        self
    }

    /// Reads every `.tal` file in `dir`.
    ///
    /// It is not an error for the directory to contain no TAL files,
    /// though a warning is logged since that leaves nothing to validate.
    pub fn read_dir(dir: impl AsRef<Path>) -> Result<Vec<Self>, ReadError> {
        let dir = dir.as_ref();
        let mut res = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("tal") {
                continue
            }
            debug!("Loading TAL {}", path.display());
            let name = path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".into());
            match Self::read_named(name, &mut File::open(&path)?) {
                Ok(tal) => res.push(tal),
                Err(err) => {
                    error!("Bad trust anchor {}: {}", path.display(), err);
                    return Err(err)
                }
            }
        }
        if res.is_empty() {
            warn!("No TALs found in {}. Starting anyway.", dir.display());
        }
        Ok(res)
    }

    /// The human-readable name of the trust anchor.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordered list of URIs to try the anchor certificate at.
    pub fn certificate_locations(&self) -> &[uri::Rsync] {
        &self.certificate_locations
    }

    /// Hint URIs for bulk warm-up.
    pub fn prefetch_uris(&self) -> &[uri::Rsync] {
        &self.prefetch_uris
    }

    /// The expected SubjectPublicKeyInfo of the anchor certificate.
    pub fn key_info(&self) -> &Bytes {
        &self.key_info
    }
}


fn take_line<'a>(data: &mut &'a [u8]) -> Result<Option<&'a [u8]>, ReadError> {
    if data.is_empty() {
        return Ok(None)
    }
    let mut split = data.splitn(2, |&ch| ch == b'\n');
    let mut line = split.next().ok_or(ReadError::UnexpectedEof)?;
    *data = split.next().unwrap_or(b"");
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    Ok(Some(line))
}

fn parse_uri(line: &[u8]) -> Result<uri::Rsync, ReadError> {
    let s = std::str::from_utf8(line).map_err(|_| ReadError::BadUri)?;
    uri::Rsync::from_str(s).map_err(|_| ReadError::BadUri)
}

use std::str::FromStr;


//------------ ReadError ---------------------------------------------------------

/// An error encountered while reading a TAL.
#[derive(Debug)]
pub enum ReadError {
    Io(io::Error),
    UnexpectedEof,
    NoCertificateLocation,
    BadUri,
    BadKeyInfoEncoding(base64::DecodeError),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ReadError::Io(err) => write!(f, "{}", err),
            ReadError::UnexpectedEof => write!(f, "unexpected end of file"),
            ReadError::NoCertificateLocation => {
                write!(f, "no certificate location given")
            }
            ReadError::BadUri => write!(f, "bad trust anchor URI"),
            ReadError::BadKeyInfoEncoding(err) => {
                write!(f, "bad key info: {}", err)
            }
        }
    }
}

impl std::error::Error for ReadError { }

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> ReadError {
        ReadError::Io(err)
    }
}

impl From<base64::DecodeError> for ReadError {
    fn from(err: base64::DecodeError) -> ReadError {
        ReadError::BadKeyInfoEncoding(err)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_tal() {
        let key = base64::encode([0u8; 32]);
        let content = format!(
            "rsync://example.org/ta/ta.cer\n\n{}\n", key
        );
        let tal = Tal::read_named(
            "example".into(), &mut content.as_bytes()
        ).unwrap();
        assert_eq!(tal.name(), "example");
        assert_eq!(tal.certificate_locations().len(), 1);
        assert_eq!(tal.key_info().as_ref(), &[0u8; 32][..]);
    }

    #[test]
    fn rejects_empty_certificate_locations() {
        let key = base64::encode([0u8; 32]);
        let content = format!("\n{}\n", key);
        let err = Tal::read_named(
            "example".into(), &mut content.as_bytes()
        ).unwrap_err();
        assert!(matches!(err, ReadError::NoCertificateLocation));
    }

    #[test]
    fn tries_locations_in_order() {
        let key = base64::encode([1u8; 32]);
        let content = format!(
            "rsync://a.example.org/ta/ta.cer\n\
             rsync://b.example.org/ta/ta.cer\n\n{}\n",
            key
        );
        let tal = Tal::read_named(
            "example".into(), &mut content.as_bytes()
        ).unwrap();
        let locs = tal.certificate_locations();
        assert_eq!(locs[0].to_string(), "rsync://a.example.org/ta/ta.cer");
        assert_eq!(locs[1].to_string(), "rsync://b.example.org/ta/ta.cer");
    }
}
